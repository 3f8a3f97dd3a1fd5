use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;

/// Schema entry for one task parameter.
///
/// `accept` lists the value kinds a submission may supply: primitive tags
/// (`str`, `float`, `datetime`, `json`) or output media types (an existing
/// output of that type, referenced by name).
#[derive(Debug, Clone)]
pub struct TaskParamMeta {
    pub name: &'static str,
    pub desc: &'static str,
    pub accept: &'static [&'static str],
    pub optional: bool,
}

impl TaskParamMeta {
    pub const fn new(
        name: &'static str,
        desc: &'static str,
        accept: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            desc,
            accept,
            optional: false,
        }
    }

    pub const fn optional(
        name: &'static str,
        desc: &'static str,
        accept: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            desc,
            accept,
            optional: true,
        }
    }
}

/// Check that every non-optional parameter in `schema` is present.
pub fn validate_params(
    schema: &[TaskParamMeta],
    params: &BTreeMap<String, String>,
) -> Result<()> {
    for meta in schema {
        if !meta.optional && !params.contains_key(meta.name) {
            return Err(Error::Validation(format!(
                "missing required parameter \"{}\" ({})",
                meta.name, meta.desc
            )));
        }
    }
    Ok(())
}

/// Fetch a required parameter value.
pub fn require_param<'a>(params: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::Validation(format!("missing required parameter \"{name}\"")))
}

/// Parse an ISO-8601 timestamp, with or without an offset. Offset-free
/// values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    Err(Error::Validation(format!("invalid timestamp: \"{value}\"")))
}

#[cfg(test)]
mod test {
    use super::*;

    const SCHEMA: &[TaskParamMeta] = &[
        TaskParamMeta::new("cctv", "stream name", &["str"]),
        TaskParamMeta::optional("confidence", "detection threshold", &["float"]),
    ];

    #[test]
    fn test_validate_accepts_complete_params() {
        let mut params = BTreeMap::new();
        params.insert("cctv".to_string(), "[A] demo".to_string());
        assert!(validate_params(SCHEMA, &params).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_required() {
        let params = BTreeMap::new();
        let err = validate_params(SCHEMA, &params).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("cctv"));
    }

    #[test]
    fn test_optional_params_may_be_absent() {
        let mut params = BTreeMap::new();
        params.insert("cctv".to_string(), "x".to_string());
        assert!(validate_params(SCHEMA, &params).is_ok());
    }

    #[test]
    fn test_parse_timestamp_rfc3339() {
        let dt = parse_timestamp("2024-06-12T08:30:00+09:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-06-11T23:30:00+00:00");
    }

    #[test]
    fn test_parse_timestamp_naive() {
        let dt = parse_timestamp("2024-06-12T08:30:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-06-12T08:30:00+00:00");
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
    }
}
