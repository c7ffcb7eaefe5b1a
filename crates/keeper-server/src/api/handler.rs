//! Envelope, request signing and shared state for the admin surface.

use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, web};
use serde::{Deserialize, Serialize};

use keeper_common::sign::{GuidParams, check_server_guid};
use keeper_core::Engine;
use keeper_registry::ServiceBook;

use crate::api::transit::TransitClient;
use crate::settings::Settings;

/// Shared secret for signed admin requests.
pub const INNER_SECRET_KEY: &str = "Kp8RmVd2qLx0ZsWnYtB4cJh6eFu1aGo3";

pub struct AppState {
    pub engine: Arc<Engine>,
    pub services: Arc<ServiceBook>,
    pub settings: Settings,
    pub transit: TransitClient,
}

/// The admin response envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resp {
    pub error_code: i32,
    pub error: String,
    pub data: serde_json::Value,
}

impl Resp {
    pub fn ok(data: impl Serialize) -> HttpResponse {
        let data = serde_json::to_value(data).unwrap_or(serde_json::Value::Null);
        HttpResponse::Ok().json(Resp {
            error_code: 0,
            error: String::new(),
            data,
        })
    }

    pub fn fail(message: impl ToString) -> HttpResponse {
        HttpResponse::Ok().json(Resp {
            error_code: 1,
            error: message.to_string(),
            data: serde_json::Value::Null,
        })
    }
}

/// Signing parameters carried in the query string of every admin request
/// outside test mode.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SignParams {
    pub partner: String,
    pub rand: String,
    pub time: String,
    pub guid: String,
}

/// Reject unsigned requests unless the server runs in test mode.
pub fn guard(state: &AppState, req: &HttpRequest) -> Result<(), HttpResponse> {
    if state.settings.test_mode {
        return Ok(());
    }
    let sign = web::Query::<SignParams>::from_query(req.query_string())
        .map(web::Query::into_inner)
        .unwrap_or_default();
    let params = GuidParams {
        partner: sign.partner,
        rand: sign.rand,
        time: sign.time,
    };
    if check_server_guid(&params, &sign.guid, INNER_SECRET_KEY) {
        Ok(())
    } else {
        Err(HttpResponse::Ok().body("access deny"))
    }
}

/// `required!(params, field, field2)` — answer with the envelope error when
/// a required parameter is missing.
macro_rules! required {
    ($params:expr, $($field:ident),+ $(,)?) => {
        $(
            if $params.$field.is_empty() {
                return crate::api::handler::Resp::fail(format!(
                    "{} is required",
                    stringify!($field)
                ));
            }
        )+
    };
}
pub(crate) use required;
