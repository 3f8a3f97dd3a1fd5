mod dummy_its_server;

pub use self::dummy_its_server::DummyItsServer;
