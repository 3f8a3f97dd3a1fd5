use roadlens_common::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Half-width of the bounding box sent to the directory, in degrees.
const DELTA_COORD: f64 = 0.01;
/// Maximum accepted squared distance between the requested coordinate and
/// the nearest directory row.
const DIST_EPSILON: f64 = 1e-6;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the national ITS CCTV directory.
///
/// Each lookup is a bounding-box query around a coordinate; the caller gets
/// the playlist URL of the nearest row. Nothing is cached: a stream's URL
/// is only valid around the moment it is requested.
pub struct ItsClient {
    http_client: reqwest::Client,
    endpoint: Url,
    api_key: String,
}

impl ItsClient {
    pub const DEFAULT_ENDPOINT: &'static str = "https://openapi.its.go.kr:9443/cctvInfo";

    pub fn new(endpoint: Url, api_key: &str) -> Self {
        let http_client = reqwest::ClientBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("HTTP client should be constructed");

        Self {
            http_client,
            endpoint,
            api_key: api_key.to_string(),
        }
    }

    /// Resolve the live HLS playlist URL for the stream nearest `(x, y)`.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, x: f64, y: f64) -> Result<Url> {
        let min_x = (x - DELTA_COORD).to_string();
        let max_x = (x + DELTA_COORD).to_string();
        let min_y = (y - DELTA_COORD).to_string();
        let max_y = (y + DELTA_COORD).to_string();

        let response = self
            .http_client
            .get(self.endpoint.clone())
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("type", "ex"),
                ("cctvType", "1"),
                ("minX", min_x.as_str()),
                ("maxX", max_x.as_str()),
                ("minY", min_y.as_str()),
                ("maxY", max_y.as_str()),
                ("getType", "json"),
            ])
            .send()
            .await
            .map_err(|err| Error::External(format!("ITS directory request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(Error::External(format!(
                "ITS directory request failed with status {}",
                response.status()
            )));
        }

        let body: ItsResponse = response
            .json()
            .await
            .map_err(|err| Error::External(format!("ITS directory response malformed: {err}")))?;

        let rows = body.response.data.map(OneOrMany::into_vec).unwrap_or_default();
        debug!("ITS directory returned {} row(s)", rows.len());

        let row = closest_row(&rows, x, y)
            .ok_or_else(|| Error::NotFound(format!("HLS stream near ({x}, {y})")))?;

        Url::parse(&row.cctvurl)
            .map_err(|err| Error::External(format!("ITS directory returned a bad URL: {err}")))
    }
}

/// Nearest row by squared Euclidean distance, if one is within the
/// acceptance threshold.
fn closest_row(rows: &[ItsCctvRow], x: f64, y: f64) -> Option<&ItsCctvRow> {
    rows.iter()
        .map(|row| {
            let dist = (x - row.coordx).powi(2) + (y - row.coordy).powi(2);
            (row, dist)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .filter(|(_, dist)| *dist <= DIST_EPSILON)
        .map(|(row, _)| row)
}

#[derive(Debug, Deserialize)]
struct ItsResponse {
    response: ItsResponseBody,
}

#[derive(Debug, Deserialize)]
struct ItsResponseBody {
    data: Option<OneOrMany<ItsCctvRow>>,
}

/// The directory returns `data` as an array, except when a single row
/// matches, in which case it is a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItsCctvRow {
    pub cctvurl: String,
    #[serde(deserialize_with = "f64_from_string_or_number")]
    pub coordx: f64,
    #[serde(deserialize_with = "f64_from_string_or_number")]
    pub coordy: f64,
    #[serde(default)]
    pub cctvname: String,
    #[serde(default)]
    pub cctvformat: String,
    #[serde(default)]
    pub cctvtype: String,
}

/// The directory encodes coordinates as strings; be permissive and accept
/// plain numbers as well.
fn f64_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(f64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.parse().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => Ok(n),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(url: &str, x: f64, y: f64) -> ItsCctvRow {
        ItsCctvRow {
            cctvurl: url.to_string(),
            coordx: x,
            coordy: y,
            cctvname: String::new(),
            cctvformat: String::new(),
            cctvtype: String::new(),
        }
    }

    #[test]
    fn test_closest_row_picks_minimum_distance() {
        let rows = vec![
            row("http://one", 126.8690, 36.9980),
            row("http://two", 126.868976, 36.997973),
        ];
        let best = closest_row(&rows, 126.868976, 36.997973).unwrap();
        assert_eq!(best.cctvurl, "http://two");
    }

    #[test]
    fn test_closest_row_rejects_distant_matches() {
        let rows = vec![row("http://far", 126.9, 37.1)];
        assert!(closest_row(&rows, 126.868976, 36.997973).is_none());
    }

    #[test]
    fn test_closest_row_empty() {
        assert!(closest_row(&[], 0.0, 0.0).is_none());
    }

    #[test]
    fn test_row_parses_string_coordinates() {
        let json = r#"{"cctvurl": "http://x/stream.m3u8", "coordx": "126.868976", "coordy": "36.997973", "cctvname": "demo"}"#;
        let row: ItsCctvRow = serde_json::from_str(json).unwrap();
        assert!((row.coordx - 126.868976).abs() < 1e-9);
    }

    #[test]
    fn test_row_parses_numeric_coordinates() {
        let json = r#"{"cctvurl": "http://x/stream.m3u8", "coordx": 126.8, "coordy": 36.9}"#;
        let row: ItsCctvRow = serde_json::from_str(json).unwrap();
        assert!((row.coordy - 36.9).abs() < 1e-9);
    }

    #[test]
    fn test_response_data_may_be_single_object() {
        let json = r#"{"response": {"data": {"cctvurl": "http://x", "coordx": "1", "coordy": "2"}}}"#;
        let body: ItsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(body.response.data.unwrap().into_vec().len(), 1);
    }

    #[test]
    fn test_response_data_may_be_array() {
        let json = r#"{"response": {"data": [
            {"cctvurl": "http://a", "coordx": "1", "coordy": "2"},
            {"cctvurl": "http://b", "coordx": "3", "coordy": "4"}
        ]}}"#;
        let body: ItsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(body.response.data.unwrap().into_vec().len(), 2);
    }

    #[test]
    fn test_response_data_may_be_absent() {
        let json = r#"{"response": {}}"#;
        let body: ItsResponse = serde_json::from_str(json).unwrap();
        assert!(body.response.data.is_none());
    }
}
