//! The admin HTTP surface.

pub mod conf;
pub mod discovery;
pub mod handler;
pub mod transit;

use actix_web::web;

pub use handler::AppState;

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(conf::domain_list)
        .service(conf::conf_list)
        .service(conf::conf_manage)
        .service(conf::conf_rollback)
        .service(conf::conf_reload)
        .service(conf::conf_status)
        .service(conf::node_list)
        .service(conf::node_info)
        .service(conf::node_manage)
        .service(conf::package_list)
        .service(conf::add_file)
        .service(conf::delete_file)
        .service(conf::delete_domain)
        .service(discovery::list_services)
        .service(discovery::get_service)
        .service(discovery::set_property);
}
