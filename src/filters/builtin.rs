//! Built-in filter kinds registered by `StaticFilterFactory::with_builtins`.
//!
//! | kind                     | phases            | settings                                   |
//! |--------------------------|-------------------|--------------------------------------------|
//! | `set_request_header`     | inbound, routing  | `name`, `value`                            |
//! | `set_response_header`    | outbound, error   | `name`, `value`                            |
//! | `remove_response_header` | outbound, error   | `name`                                     |
//! | `static_response`        | inbound, routing  | `status` (200), `body` (""), `content_type`|
//! | `error_response`         | error             | `status`, `expose_details` (false)         |

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};

use crate::filters::factory::{FilterCompilationError, StaticFilterFactory};
use crate::filters::unit::{from_fn, FilterError, FilterOutcome, Phase};

pub(crate) fn register(factory: &mut StaticFilterFactory) {
    factory.register(
        "set_request_header",
        &[Phase::Inbound, Phase::Routing],
        |settings| {
            let name = header_name(settings, "name")?;
            let value = header_value(settings, "value")?;
            Ok(Box::new(from_fn(move |ctx| {
                ctx.request_mut()
                    .headers_mut()
                    .insert(name.clone(), value.clone());
                Ok(FilterOutcome::Continue)
            })))
        },
    );

    factory.register(
        "set_response_header",
        &[Phase::Outbound, Phase::Error],
        |settings| {
            let name = header_name(settings, "name")?;
            let value = header_value(settings, "value")?;
            Ok(Box::new(from_fn(move |ctx| {
                if let Some(response) = ctx.response_mut() {
                    response.headers_mut().insert(name.clone(), value.clone());
                }
                Ok(FilterOutcome::Continue)
            })))
        },
    );

    factory.register(
        "remove_response_header",
        &[Phase::Outbound, Phase::Error],
        |settings| {
            let name = header_name(settings, "name")?;
            Ok(Box::new(from_fn(move |ctx| {
                if let Some(response) = ctx.response_mut() {
                    response.headers_mut().remove(&name);
                }
                Ok(FilterOutcome::Continue)
            })))
        },
    );

    factory.register(
        "static_response",
        &[Phase::Inbound, Phase::Routing],
        |settings| {
            let status = status(settings, "status")?.unwrap_or(StatusCode::OK);
            let body = optional_str(settings, "body")?.unwrap_or_default().to_string();
            let content_type = match optional_str(settings, "content_type")? {
                Some(ct) => HeaderValue::from_str(ct)
                    .map_err(|e| FilterCompilationError::invalid_setting("content_type", e.to_string()))?,
                None => HeaderValue::from_static("text/plain; charset=utf-8"),
            };
            Ok(Box::new(from_fn(move |ctx| {
                let response = Response::builder()
                    .status(status)
                    .header(CONTENT_TYPE, content_type.clone())
                    .body(Body::from(body.clone()))
                    .map_err(|e| FilterError::failed(e.to_string()))?;
                ctx.set_response(response);
                Ok(FilterOutcome::Stop)
            })))
        },
    );

    factory.register("error_response", &[Phase::Error], |settings| {
        let status_override = status(settings, "status")?;
        let expose_details = match settings.get("expose_details") {
            Some(value) => value.as_bool().ok_or_else(|| {
                FilterCompilationError::invalid_setting("expose_details", "expected a boolean")
            })?,
            None => false,
        };
        Ok(Box::new(from_fn(move |ctx| {
            let failure_status = ctx.failure().map(|f| f.error.status());
            let status = status_override
                .or(failure_status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

            let mut body = serde_json::json!({
                "status": status.as_u16(),
                "error": status.canonical_reason().unwrap_or("Error"),
                "request_id": ctx.id(),
            });
            if expose_details {
                if let Some(failure) = ctx.failure() {
                    body["filter"] = serde_json::Value::from(failure.filter.as_ref());
                    body["detail"] = serde_json::Value::from(failure.error.to_string());
                }
            }

            let response = Response::builder()
                .status(status)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .map_err(|e| FilterError::failed(e.to_string()))?;
            ctx.set_response(response);
            Ok(FilterOutcome::Continue)
        })))
    });
}

fn optional_str<'a>(
    settings: &'a toml::Table,
    key: &str,
) -> Result<Option<&'a str>, FilterCompilationError> {
    match settings.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| FilterCompilationError::invalid_setting(key, "expected a string")),
    }
}

fn required_str<'a>(settings: &'a toml::Table, key: &str) -> Result<&'a str, FilterCompilationError> {
    optional_str(settings, key)?
        .ok_or_else(|| FilterCompilationError::invalid_setting(key, "missing"))
}

fn header_name(settings: &toml::Table, key: &str) -> Result<HeaderName, FilterCompilationError> {
    HeaderName::from_bytes(required_str(settings, key)?.as_bytes())
        .map_err(|e| FilterCompilationError::invalid_setting(key, e.to_string()))
}

fn header_value(settings: &toml::Table, key: &str) -> Result<HeaderValue, FilterCompilationError> {
    HeaderValue::from_str(required_str(settings, key)?)
        .map_err(|e| FilterCompilationError::invalid_setting(key, e.to_string()))
}

fn status(settings: &toml::Table, key: &str) -> Result<Option<StatusCode>, FilterCompilationError> {
    let Some(value) = settings.get(key) else {
        return Ok(None);
    };
    let code = value
        .as_integer()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| FilterCompilationError::invalid_setting(key, "expected an HTTP status code"))?;
    StatusCode::from_u16(code)
        .map(Some)
        .map_err(|e| FilterCompilationError::invalid_setting(key, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::context::{FilterFailure, RequestContext};
    use crate::filters::factory::FilterFactory;
    use crate::filters::unit::FilterUnit;
    use axum::http::Request;

    fn unit(text: &str) -> FilterUnit {
        StaticFilterFactory::with_builtins()
            .compile_text("test", text, "")
            .unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Request::get("/").body(Body::empty()).unwrap())
    }

    #[tokio::test]
    async fn static_response_stops_chain() {
        let unit = unit(
            r#"
            kind = "static_response"
            phase = "inbound"
            [settings]
            status = 301
            body = "moved"
            "#,
        );
        let mut ctx = ctx();
        assert_eq!(unit.apply(&mut ctx).await.unwrap(), FilterOutcome::Stop);
        assert_eq!(ctx.response().unwrap().status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[tokio::test]
    async fn error_response_uses_failure_status() {
        let unit = unit("kind = \"error_response\"\nphase = \"error\"\n[settings]\nexpose_details = true");
        let mut ctx = ctx();
        ctx.record_failure(FilterFailure::origin(FilterError::with_status(
            StatusCode::BAD_GATEWAY,
            "upstream down",
        )));

        unit.apply(&mut ctx).await.unwrap();

        let response = ctx.into_response().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], 502);
        assert_eq!(json["detail"], "upstream down");
    }

    #[test]
    fn invalid_settings_fail_compilation() {
        let factory = StaticFilterFactory::with_builtins();
        let missing = factory.compile_text("t", "kind = \"set_request_header\"\nphase = \"inbound\"", "");
        assert!(matches!(
            missing.unwrap_err(),
            FilterCompilationError::InvalidSetting { key, .. } if key == "name"
        ));

        let bad_status = factory.compile_text(
            "t",
            "kind = \"static_response\"\nphase = \"inbound\"\n[settings]\nstatus = 42",
            "",
        );
        assert!(bad_status.is_err());
    }

    #[tokio::test]
    async fn header_filters_edit_response() {
        let set = unit("kind = \"set_response_header\"\nphase = \"outbound\"\n[settings]\nname = \"x-a\"\nvalue = \"1\"");
        let remove = unit("kind = \"remove_response_header\"\nphase = \"outbound\"\n[settings]\nname = \"server\"");

        let mut ctx = ctx();
        ctx.set_response(
            Response::builder()
                .header("server", "backend")
                .body(Body::empty())
                .unwrap(),
        );
        set.apply(&mut ctx).await.unwrap();
        remove.apply(&mut ctx).await.unwrap();

        let headers = ctx.response().unwrap().headers();
        assert_eq!(headers["x-a"], "1");
        assert!(!headers.contains_key("server"));
    }
}
