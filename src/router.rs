//! Classification of completed transport calls.
//!
//! A call either failed at the transport level, or produced a status code. Status codes are looked up in a table of
//! known codes: `200` is the only success, every other known code is an application-level error and anything outside
//! the table is an [`UnknownStatus`](FetchError::UnknownStatus) error. Successful bodies are parsed according to the
//! declared response type.

use std::sync::Arc;

use serde_json::Value;

use crate::error::FetchError;
use crate::error::TransportError;
use crate::types::EntityMap;
use crate::types::ResponseBody;
use crate::types::ResponseType;
use crate::types::TransportResponse;
use crate::types::Verb;

pub const SUCCESS: u16 = 200;

/// Field holding the identifier when a batch read answers with a list of entities.
pub const ID_FIELD: &str = "_id";

#[rustfmt::skip]
const KNOWN_STATUSES: &[u16] = &[
    100, 101, 102, 103,
    200, 201, 202, 203, 204, 205, 206, 207, 208, 226,
    300, 301, 302, 303, 304, 305, 307, 308,
    400, 401, 402, 403, 404, 405, 406, 407, 408, 409, 410, 411, 412, 413, 414, 415, 416, 417, 418,
    421, 422, 423, 424, 425, 426, 428, 429, 431, 451,
    500, 501, 502, 503, 504, 505, 506, 507, 508, 510, 511,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFamily {
    Success,
    Error,
}

/// `None` for codes that are not in the table.
pub fn classify(status: u16) -> Option<StatusFamily> {
    if status == SUCCESS {
        Some(StatusFamily::Success)
    }
    else if KNOWN_STATUSES.binary_search(&status).is_ok() {
        Some(StatusFamily::Error)
    }
    else {
        None
    }
}

/// Parse a body according to its declared type.
pub fn parse_body(response_type: ResponseType, body: Vec<u8>) -> Result<ResponseBody, String> {
    Ok(match response_type {
        ResponseType::Json => {
            if body.iter().all(u8::is_ascii_whitespace) {
                ResponseBody::Json(Value::Null)
            }
            else {
                ResponseBody::Json(serde_json::from_slice(&body).map_err(|e| e.to_string())?)
            }
        }
        ResponseType::ArrayBuffer | ResponseType::Blob => ResponseBody::Bytes(body),
        ResponseType::Text | ResponseType::Default => ResponseBody::Text(String::from_utf8_lossy(&body).into_owned()),
    })
}

// Error bodies are whatever the server felt like sending; never fail on them.
fn lenient_body(response_type: ResponseType, body: Vec<u8>) -> ResponseBody {
    match parse_body(response_type, body.clone()) {
        Ok(parsed) => parsed,
        Err(_) => ResponseBody::Text(String::from_utf8_lossy(&body).into_owned()),
    }
}

/// Turn the outcome of a transport call into what the caller gets.
pub fn route(
    verb: Verb,
    url: &str,
    response_type: ResponseType,
    outcome: Result<TransportResponse, TransportError>,
) -> Result<ResponseBody, FetchError> {
    let response = outcome.map_err(|source| FetchError::Transport {
        verb,
        url: url.to_string(),
        source,
    })?;
    let status = response.status;

    match classify(status) {
        Some(StatusFamily::Success) => {
            parse_body(response_type, response.body).map_err(|message| FetchError::Decode {
                verb,
                url: url.to_string(),
                message,
            })
        }
        Some(StatusFamily::Error) => Err(FetchError::Status {
            verb,
            url: url.to_string(),
            status,
            body: lenient_body(response_type, response.body),
        }),
        None => Err(FetchError::UnknownStatus {
            verb,
            url: url.to_string(),
            status,
            body: lenient_body(response_type, response.body),
        }),
    }
}

/// Extract entities from the response to a batch read. Either an object keyed by id, or an array of objects with an
/// [`ID_FIELD`].
pub fn decode_entities(verb: Verb, url: &str, body: ResponseBody) -> Result<EntityMap, FetchError> {
    let decode_error = |message: String| FetchError::Decode {
        verb,
        url: url.to_string(),
        message,
    };

    match body {
        ResponseBody::Json(Value::Object(entities)) => Ok(entities.into_iter().map(|(k, v)| (k, Arc::new(v))).collect()),
        ResponseBody::Json(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item.get(ID_FIELD).and_then(Value::as_str) {
                Some(id) => Ok((id.to_string(), Arc::new(item))),
                None => Err(decode_error(format!("entity without '{ID_FIELD}': {item}"))),
            })
            .collect(),
        ResponseBody::Json(Value::Null) => Ok(EntityMap::new()),
        other => Err(decode_error(format!("expected a JSON object or array of entities, got {other:?}"))),
    }
}
