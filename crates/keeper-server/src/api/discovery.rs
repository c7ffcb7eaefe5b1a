//! Admin endpoints for the service registry.

use actix_web::{HttpRequest, HttpResponse, get, post, web};
use serde::Deserialize;
use tracing::error;

use keeper_registry::Property;

use crate::api::handler::{AppState, Resp, guard, required};

#[get("/discovery/list/services")]
pub async fn list_services(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    match state.services.registry().list_services().await {
        Ok(services) => Resp::ok(services),
        Err(e) => {
            error!("list services: {}", e);
            Resp::fail(format!("ListServices error:{e}"))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GetServiceParams {
    pub service_name: String,
}

#[get("/discovery/get/service")]
pub async fn get_service(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Query<GetServiceParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    required!(params, service_name);

    match state
        .services
        .registry()
        .get_service(&params.service_name)
        .await
    {
        Ok(service) => Resp::ok(service),
        Err(e) => {
            error!("get service {}: {}", params.service_name, e);
            Resp::fail(format!("GetService error:{e}"))
        }
    }
}

#[post("/discovery/set/property")]
pub async fn set_property(
    req: HttpRequest,
    state: web::Data<AppState>,
    property: web::Json<Property>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    if property.service_name.is_empty() {
        return Resp::fail("service_name is required");
    }
    match state.services.registry().set_property(&property).await {
        Ok(()) => Resp::ok(()),
        Err(e) => {
            error!("set property of {}: {}", property.service_name, e);
            Resp::fail(format!("SetProperty error:{e}"))
        }
    }
}
