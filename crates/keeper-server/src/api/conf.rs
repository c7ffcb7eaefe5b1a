//! Admin endpoints for domains, configuration and nodes.

use std::collections::{BTreeMap, HashSet};

use actix_web::{HttpRequest, HttpResponse, get, post, web};
use serde::Deserialize;
use tracing::error;

use keeper_api::{NodeSnapshot, Operate, SyncEvent};
use keeper_common::error::Result;
use keeper_common::utils::{agent_node_id, decode_keeper_addr};
use keeper_config::ini;

use crate::api::handler::{AppState, Resp, guard, required};

fn is_transit(flag: &str) -> bool {
    flag == "true"
}

/// Admin addresses of every keeper serving a domain.
async fn admin_addrs(state: &AppState, domain: &str) -> Result<Vec<String>> {
    let raw = state.engine.store.get_keeper_addrs(domain, false).await?;
    Ok(raw
        .iter()
        .map(|addr| decode_keeper_addr(addr).0)
        .filter(|addr| !addr.is_empty())
        .collect())
}

/// Admin address of the keeper a node registered on.
async fn admin_addr(state: &AppState, domain: &str, node_id: &str) -> Result<String> {
    let raw = state
        .engine
        .store
        .get_keeper_addr(domain, node_id, true)
        .await?;
    Ok(decode_keeper_addr(&raw).0)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DomainParams {
    pub domain: String,
    pub transit: String,
}

#[get("/domain/list")]
pub async fn domain_list(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    Resp::ok(state.engine.domains.domain_infos())
}

#[get("/conf/list")]
pub async fn conf_list(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Query<DomainParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    match state.engine.confs.get(&params.domain) {
        Ok(conf) => Resp::ok(conf.file_list()),
        Err(e) => {
            error!("conf list of {}: {}", params.domain, e);
            Resp::fail(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfManageParams {
    pub domain: String,
    pub operates: String,
    pub note: String,
}

#[post("/conf/manage")]
pub async fn conf_manage(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Form<ConfManageParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    required!(params, domain, operates);

    let mut operates: Vec<Operate> = match serde_json::from_str(&params.operates) {
        Ok(operates) => operates,
        Err(e) => {
            error!("conf manage decode operates: {}", e);
            return Resp::fail(e);
        }
    };
    if operates.is_empty() {
        return Resp::fail("operates is empty");
    }
    let notes: Vec<String> = serde_json::from_str(&params.note).unwrap_or_default();

    let event = if operates.len() == 1 {
        let mut operate = operates.remove(0);
        operate.domain = params.domain.clone();
        operate.note = notes
            .first()
            .cloned()
            .unwrap_or_else(|| params.note.clone());
        SyncEvent::Operate(operate)
    } else {
        for (index, operate) in operates.iter_mut().enumerate() {
            operate.domain = params.domain.clone();
            if let Some(note) = notes.get(index) {
                operate.note = note.clone();
            }
        }
        SyncEvent::OperateBatch(operates)
    };

    match state.engine.apply_operate_event(event).await {
        Ok(()) => Resp::ok(()),
        Err(e) => {
            error!("conf manage of {}: {}", params.domain, e);
            Resp::fail(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RollbackParams {
    pub domain: String,
    pub id: String,
}

#[post("/conf/rollback")]
pub async fn conf_rollback(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Form<RollbackParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    required!(params, domain, id);

    let version: i64 = match params.id.parse() {
        Ok(version) => version,
        Err(e) => return Resp::fail(e),
    };
    let operate = Operate {
        domain: params.domain.clone(),
        version,
        note: format!("rollback to version:{}", params.id),
        ..Default::default()
    };
    match state
        .engine
        .apply_operate_event(SyncEvent::OperateRollback(operate))
        .await
    {
        Ok(()) => Resp::ok(()),
        Err(e) => {
            error!("rollback {} to {}: {}", params.domain, version, e);
            Resp::fail(e)
        }
    }
}

#[post("/conf/reload")]
pub async fn conf_reload(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Form<DomainParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    required!(params, domain);

    let mut status: BTreeMap<String, bool> = BTreeMap::new();
    if !is_transit(&params.transit) {
        let keepers = match state.engine.store.get_alive_keeper_nodes(true).await {
            Ok(keepers) => keepers,
            Err(e) => {
                error!("conf reload list keepers: {}", e);
                return Resp::fail(e);
            }
        };
        for host in keepers.values() {
            if *host == state.settings.keeper_admin_addr {
                continue;
            }
            status.insert(host.clone(), false);
            match state.transit.conf_reload(host, &params.domain).await {
                Ok(remote) => {
                    if let Some(ok) = remote.get(host) {
                        status.insert(host.clone(), *ok);
                    }
                }
                Err(e) => error!("conf reload transit {}: {}", host, e),
            }
        }
    }

    let engine = &state.engine;
    let reloaded = async {
        engine.confs.reload(&engine.store, &params.domain).await?;
        let conf = engine.confs.get(&params.domain)?;
        let version = engine
            .store
            .get_current_version(&params.domain, false)
            .await?;
        engine.domains.add_domain(&params.domain);
        engine.domains.reload(&params.domain, version, &conf)
    }
    .await;
    if let Err(e) = reloaded {
        error!("conf reload of {}: {}", params.domain, e);
        return Resp::fail(e);
    }
    status.insert(state.settings.keeper_admin_addr.clone(), true);
    Resp::ok(status)
}

#[get("/conf/status")]
pub async fn conf_status(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Query<DomainParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    let domain = match state.engine.domains.get_domain(&params.domain) {
        Ok(domain) => domain,
        Err(e) => return Resp::fail(e),
    };

    let mut nodes = Vec::new();
    if !is_transit(&params.transit) {
        let hosts = match admin_addrs(&state, &params.domain).await {
            Ok(hosts) => hosts,
            Err(e) => {
                error!("conf status keeper addrs of {}: {}", params.domain, e);
                return Resp::fail(e);
            }
        };
        for host in hosts {
            if host == state.settings.keeper_admin_addr {
                continue;
            }
            match state.transit.conf_status(&host, &params.domain).await {
                Ok(remote) => nodes.extend(remote),
                Err(e) => error!("conf status transit {}: {}", host, e),
            }
        }
    }
    for node in domain.nodes() {
        nodes.push(node.info());
    }
    Resp::ok(nodes)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeListParams {
    pub domain: String,
    pub component: String,
    pub transit: String,
}

#[get("/node/list")]
pub async fn node_list(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Query<NodeListParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    let domain = match state.engine.domains.get_domain(&params.domain) {
        Ok(domain) => domain,
        Err(e) => return Resp::fail(e),
    };

    let mut remote: Vec<NodeSnapshot> = Vec::new();
    if !is_transit(&params.transit) {
        let hosts = match admin_addrs(&state, &params.domain).await {
            Ok(hosts) => hosts,
            Err(e) => {
                error!("node list keeper addrs of {}: {}", params.domain, e);
                return Resp::fail(e);
            }
        };
        for host in hosts {
            if host == state.settings.keeper_admin_addr {
                continue;
            }
            match state
                .transit
                .node_list(&host, &params.domain, &params.component)
                .await
            {
                Ok(snapshots) => remote.extend(snapshots),
                Err(e) => error!("node list transit {}: {}", host, e),
            }
        }
    }

    let mut local = Vec::new();
    for node in domain.nodes() {
        if !params.component.is_empty() && node.component() != params.component {
            continue;
        }
        local.push(node.snapshot());
        // ask the node for fresh process stats on its next heartbeat
        let _ = node.add_event(SyncEvent::Proc(None));
    }

    // a node seen both remotely and here is reported once; the local copy
    // is the one receiving heartbeats
    let local_ids: HashSet<String> = local.iter().map(|n| n.info.id.clone()).collect();
    let mut nodes: Vec<NodeSnapshot> = remote
        .into_iter()
        .filter(|n| !local_ids.contains(&n.info.id))
        .collect();
    nodes.extend(local);
    Resp::ok(nodes)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeInfoParams {
    pub domain: String,
    pub nodeid: String,
    pub transit: String,
}

#[get("/node/info")]
pub async fn node_info(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Query<NodeInfoParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    let domain = match state.engine.domains.get_domain(&params.domain) {
        Ok(domain) => domain,
        Err(e) => return Resp::fail(e),
    };

    if !is_transit(&params.transit) {
        let host = match admin_addr(&state, &params.domain, &params.nodeid).await {
            Ok(host) => host,
            Err(e) => {
                error!("node info keeper addr of {}: {}", params.nodeid, e);
                return Resp::fail(e);
            }
        };
        if host != state.settings.keeper_admin_addr {
            return match state
                .transit
                .node_info(&host, &params.domain, &params.nodeid)
                .await
            {
                Ok(envelope) => HttpResponse::Ok().json(Resp {
                    error_code: envelope.error_code,
                    error: envelope.error,
                    data: envelope.data.unwrap_or(serde_json::Value::Null),
                }),
                Err(e) => Resp::fail(e),
            };
        }
    }

    match domain.get_node(&params.nodeid) {
        Ok(node) => {
            let _ = node.add_event(SyncEvent::Proc(None));
            Resp::ok(node.snapshot())
        }
        Err(e) => {
            error!("node info of {}: {}", params.nodeid, e);
            Resp::fail(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeManageParams {
    pub domain: String,
    pub operate: String,
    pub nodeid: String,
    pub component: String,
    pub transit: String,
}

#[post("/node/manage")]
pub async fn node_manage(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Form<NodeManageParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    required!(params, domain, operate, nodeid, component);

    if !is_transit(&params.transit) {
        let agent_id = agent_node_id(&params.nodeid);
        let host = match admin_addr(&state, &params.domain, agent_id).await {
            Ok(host) => host,
            Err(e) => {
                error!("node manage keeper addr of {}: {}", agent_id, e);
                return Resp::fail(e);
            }
        };
        if host != state.settings.keeper_admin_addr {
            return match state
                .transit
                .node_manage(
                    &host,
                    &params.domain,
                    &params.operate,
                    &params.nodeid,
                    &params.component,
                )
                .await
            {
                Ok(()) => Resp::ok(()),
                Err(e) => Resp::fail(e),
            };
        }
    }

    match state.engine.command_node(
        &params.domain,
        &params.operate,
        &params.nodeid,
        &params.component,
    ) {
        Ok(()) => Resp::ok(()),
        Err(e) => {
            error!("node manage {} {}: {}", params.operate, params.nodeid, e);
            Resp::fail(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PackageListParams {
    pub domain: String,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[get("/package/list")]
pub async fn package_list(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Query<PackageListParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    required!(params, domain);

    let offset = params.offset.unwrap_or(0);
    let limit = match params.limit {
        Some(limit) if limit > 0 => limit,
        _ => 50,
    };
    match state
        .engine
        .store
        .get_history_versions(&params.domain, limit, offset, true)
        .await
    {
        Ok(recodes) => Resp::ok(recodes),
        Err(e) => {
            error!("package list of {}: {}", params.domain, e);
            Resp::fail(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AddFileParams {
    pub domain: String,
    pub file: String,
    pub conf: String,
    pub note: String,
}

#[post("/add/file")]
pub async fn add_file(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Form<AddFileParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    required!(params, domain, file, conf, note);

    if ini::ignore_file(&params.file, false) {
        return Resp::fail(format!("file name {} is invalid", params.file));
    }
    let parsed = match ini::parse_conf_text(&params.conf) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("add file {} parse: {}", params.file, e);
            return Resp::fail(e);
        }
    };
    let data = match ini::to_storage_map(&parsed) {
        Ok(data) => data,
        Err(e) => return Resp::fail(e),
    };
    match state
        .engine
        .store
        .add_file(&params.domain, &params.file, data, &params.note)
        .await
    {
        Ok(()) => Resp::ok(()),
        Err(e) => {
            error!("add file {} of {}: {}", params.file, params.domain, e);
            Resp::fail(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeleteFileParams {
    pub domain: String,
    pub file: String,
    pub note: String,
}

#[post("/delete/file")]
pub async fn delete_file(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Form<DeleteFileParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    required!(params, domain, file, note);

    match state
        .engine
        .store
        .del_file(&params.domain, &params.file, &params.note)
        .await
    {
        Ok(()) => Resp::ok(()),
        Err(e) => {
            error!("delete file {} of {}: {}", params.file, params.domain, e);
            Resp::fail(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeleteDomainParams {
    pub domain: String,
    pub note: String,
}

#[post("/delete/domain")]
pub async fn delete_domain(
    req: HttpRequest,
    state: web::Data<AppState>,
    params: web::Form<DeleteDomainParams>,
) -> HttpResponse {
    if let Err(resp) = guard(&state, &req) {
        return resp;
    }
    required!(params, domain, note);

    match state
        .engine
        .store
        .del_domain(&params.domain, &params.note)
        .await
    {
        Ok(()) => Resp::ok(()),
        Err(e) => {
            error!("delete domain {}: {}", params.domain, e);
            Resp::fail(e)
        }
    }
}
