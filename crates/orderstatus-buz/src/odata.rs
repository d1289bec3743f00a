//! OData request shaping and response decoding.

use orderstatus_core::{Instance, Query, Result, Row, StatusError};
use serde::Deserialize;

/// A request ready to send: either a GET with the query in the URL or,
/// for long queries, a POST to the `$query` resource with the same query
/// string as the body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PreparedRequest {
    Get { url: String },
    Post { url: String, body: String },
}

impl PreparedRequest {
    pub(crate) fn url(&self) -> &str {
        match self {
            Self::Get { url } | Self::Post { url, .. } => url,
        }
    }
}

/// Percent-encoded query string (`$filter=...`), empty when there are no filters.
pub(crate) fn query_string(query: &Query) -> String {
    if query.filters.is_empty() {
        return String::new();
    }
    format!("$filter={}", urlencoding::encode(&query.filter_expression()))
}

/// Builds the request for `query` against `root_url`.
///
/// Switches to POST when the GET URL would be longer than `max_url_length`.
pub(crate) fn prepare(root_url: &str, query: &Query, max_url_length: usize) -> PreparedRequest {
    let resource = format!(
        "{}/{}",
        root_url.trim_end_matches('/'),
        query.endpoint.trim_start_matches('/')
    );
    let qs = query_string(query);
    if qs.is_empty() {
        return PreparedRequest::Get { url: resource };
    }

    let url = format!("{resource}?{qs}");
    if url.len() <= max_url_length {
        PreparedRequest::Get { url }
    } else {
        PreparedRequest::Post {
            url: format!("{resource}/$query"),
            body: qs,
        }
    }
}

/// OData collection envelope.
#[derive(Debug, Deserialize)]
struct ODataResponse {
    #[serde(default)]
    value: Vec<Row>,
}

/// Decodes an OData response body and tags each row with its instance.
pub(crate) fn parse_rows(instance: &Instance, body: &str) -> Result<Vec<Row>> {
    let response: ODataResponse = serde_json::from_str(body).map_err(|e| {
        StatusError::Parse(format!("{instance}: invalid OData response: {e}"))
    })?;

    Ok(response
        .value
        .into_iter()
        .map(|mut row| {
            row.insert(
                "Instance".to_string(),
                serde_json::Value::String(instance.to_string()),
            );
            row
        })
        .collect())
}
