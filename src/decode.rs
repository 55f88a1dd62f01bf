use crate::error::ErrorBody;
use crate::transport::TransportResponse;
use crate::{Blob, CourierError, ResponseData, ResponseType, Result};

/// Decodes a validated response according to `response_type`.
///
/// `form_data_supported` reflects the active transport; when it is `false`,
/// [`ResponseType::FormData`] fails with [`CourierError::Unsupported`].
pub(crate) fn decode_body(
    response: &TransportResponse,
    response_type: ResponseType,
    form_data_supported: bool,
) -> Result<ResponseData> {
    let body = response.body.clone();
    match response_type {
        ResponseType::Json => {
            if body.is_empty() {
                return Ok(ResponseData::Json(serde_json::Value::Null));
            }
            serde_json::from_slice(&body)
                .map(ResponseData::Json)
                .map_err(|err| CourierError::Decode {
                    message: format!("invalid json response: {err}"),
                    raw: String::from_utf8_lossy(&body).into_owned(),
                })
        }
        ResponseType::Text => Ok(ResponseData::Text(
            String::from_utf8_lossy(&body).into_owned(),
        )),
        ResponseType::Blob => Ok(ResponseData::Blob(Blob {
            content_type: response.content_type().map(str::to_owned),
            bytes: body,
        })),
        ResponseType::ArrayBuffer => Ok(ResponseData::ArrayBuffer(body)),
        ResponseType::FormData => {
            if !form_data_supported {
                return Err(CourierError::Unsupported(
                    "formData responses are not supported by this transport".to_owned(),
                ));
            }
            decode_form_data(response)
        }
    }
}

fn decode_form_data(response: &TransportResponse) -> Result<ResponseData> {
    let media_type = response
        .content_type()
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase());

    match media_type.as_deref() {
        None | Some("application/x-www-form-urlencoded") => {
            let pairs = url::form_urlencoded::parse(&response.body)
                .into_owned()
                .collect();
            Ok(ResponseData::FormData(pairs))
        }
        Some(other) => Err(CourierError::Decode {
            message: format!("cannot decode '{other}' body as form data"),
            raw: String::from_utf8_lossy(&response.body).into_owned(),
        }),
    }
}

/// Builds the error for a response whose status was rejected.
///
/// The body is inspected through a clone so the response stays intact.
pub(crate) fn status_error(response: &TransportResponse) -> CourierError {
    CourierError::Http {
        status: response.status.as_u16(),
        body: capture_error_body(response),
    }
}

fn capture_error_body(response: &TransportResponse) -> ErrorBody {
    let body = response.body.clone();
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
        return ErrorBody::Json(value);
    }
    let text = String::from_utf8_lossy(&body);
    if !text.trim().is_empty() {
        return ErrorBody::Text(text.into_owned());
    }
    ErrorBody::StatusText(
        response
            .status
            .canonical_reason()
            .unwrap_or("Unknown Status")
            .to_owned(),
    )
}
