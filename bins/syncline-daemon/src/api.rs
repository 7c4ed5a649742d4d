use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, info};
use tokio::io::AsyncReadExt;

use syncline_api::{AuthCode, BulkAclUpdate, ObjectUpdatePayload, Organization, WebhookUpdate};
use syncline_core::error::SyncError;
use syncline_core::security::{can_user_access_object, can_user_create_object};
use syncline_core::SyncService;

const UNAUTHORIZED: &[u8] = b"Unauthorized";

type ApiResponse = Response<Full<Bytes>>;

pub async fn handle_request(
    service: Arc<SyncService>,
    req: Request<Incoming>,
) -> Result<ApiResponse, hyper::Error> {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let segments: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .map(|s| s.to_string())
        .collect();

    if segments.len() < 3 || segments[0] != "api" || segments[1] != "v1" {
        return Ok(plain(StatusCode::NOT_FOUND, b"not found"));
    }
    let rest: Vec<String> = segments[3..].to_vec();
    match segments[2].as_str() {
        "destinations" => handle_destinations(service, req, rest).await,
        "objects" => handle_objects(service, req, rest).await,
        "organizations" => handle_organizations(service, req, rest).await,
        "security" => handle_security(service, req, rest).await,
        "resend" => handle_resend(service, req).await,
        "shutdown" => handle_shutdown(service, req).await,
        _ => Ok(plain(StatusCode::NOT_FOUND, b"not found")),
    }
}

async fn handle_destinations(
    service: Arc<SyncService>,
    req: Request<Incoming>,
    rest: Vec<String>,
) -> Result<ApiResponse, hyper::Error> {
    if !service.is_running() {
        return Ok(status_only(StatusCode::SERVICE_UNAVAILABLE));
    }
    let Some(caller) = authenticate(&service, &req).await else {
        return Ok(forbidden());
    };
    if matches!(caller.code, AuthCode::Failed | AuthCode::EdgeNode) {
        return Ok(forbidden());
    }
    if req.method() != Method::GET {
        return Ok(status_only(StatusCode::METHOD_NOT_ALLOWED));
    }
    let Some(org_id) = rest.first() else {
        return Ok(status_only(StatusCode::BAD_REQUEST));
    };
    if caller.org != *org_id && caller.code != AuthCode::SyncAdmin {
        return Ok(forbidden());
    }
    match service.list_destinations(org_id).await {
        Ok(dests) if dests.is_empty() => Ok(status_only(StatusCode::NOT_FOUND)),
        Ok(dests) => Ok(json(StatusCode::OK, &dests)),
        Err(err) => Ok(error_response(&err)),
    }
}

async fn handle_objects(
    service: Arc<SyncService>,
    req: Request<Incoming>,
    rest: Vec<String>,
) -> Result<ApiResponse, hyper::Error> {
    if !service.is_running() {
        return Ok(status_only(StatusCode::SERVICE_UNAVAILABLE));
    }
    let Some(caller) = authenticate(&service, &req).await else {
        return Ok(forbidden());
    };
    if caller.code == AuthCode::Failed {
        return Ok(forbidden());
    }

    match rest.len() {
        // /objects/{orgID}/{type}: GET lists updated objects, PUT manages a
        // webhook.
        2 => {
            let (org_id, object_type) = (&rest[0], &rest[1]);
            if !can_user_access_object(
                service.store(),
                caller.code,
                &caller.org,
                &caller.username,
                org_id,
                object_type,
            )
            .await
            {
                return Ok(forbidden());
            }
            let method = req.method().clone();
            match method {
                Method::GET => {
                    let received = match query_param(&req, "received") {
                        Some(value) => match value.parse::<bool>() {
                            Ok(flag) => flag,
                            Err(_) => return Ok(status_only(StatusCode::BAD_REQUEST)),
                        },
                        None => false,
                    };
                    match service.list_updated_objects(org_id, object_type, received).await {
                        Ok(objects) if objects.is_empty() => {
                            Ok(status_only(StatusCode::NOT_FOUND))
                        }
                        Ok(objects) => Ok(json(StatusCode::OK, &objects)),
                        Err(err) => Ok(error_response(&err)),
                    }
                }
                Method::PUT => {
                    let org_id = org_id.clone();
                    let object_type = object_type.clone();
                    let body = req.into_body().collect().await?.to_bytes();
                    let payload: WebhookUpdate = match serde_json::from_slice(&body) {
                        Ok(payload) => payload,
                        Err(_) => return Ok(status_only(StatusCode::BAD_REQUEST)),
                    };
                    let result = if payload.action.eq_ignore_ascii_case("delete") {
                        service.delete_webhook(&org_id, &object_type, &payload.url).await
                    } else if payload.action.eq_ignore_ascii_case("register") {
                        service.register_webhook(&org_id, &object_type, &payload.url).await
                    } else {
                        return Ok(status_only(StatusCode::BAD_REQUEST));
                    };
                    match result {
                        Ok(()) => Ok(status_only(StatusCode::OK)),
                        Err(err) => Ok(error_response(&err)),
                    }
                }
                _ => Ok(status_only(StatusCode::METHOD_NOT_ALLOWED)),
            }
        }

        // /objects/{orgID}/{type}/{id}: read, delete or upsert an object.
        3 => {
            let (org_id, object_type, object_id) = (&rest[0], &rest[1], &rest[2]);
            let method = req.method().clone();
            match method {
                Method::GET => {
                    if !can_user_access_object(
                        service.store(),
                        caller.code,
                        &caller.org,
                        &caller.username,
                        org_id,
                        object_type,
                    )
                    .await
                    {
                        return Ok(forbidden());
                    }
                    match service.get_object(org_id, object_type, object_id).await {
                        Ok(meta) => Ok(json(StatusCode::OK, &meta)),
                        Err(err) => Ok(error_response(&err)),
                    }
                }
                Method::DELETE => {
                    if !can_user_access_object(
                        service.store(),
                        caller.code,
                        &caller.org,
                        &caller.username,
                        org_id,
                        object_type,
                    )
                    .await
                    {
                        return Ok(forbidden());
                    }
                    match service.delete_object(org_id, object_type, object_id).await {
                        Ok(()) => Ok(status_only(StatusCode::NO_CONTENT)),
                        Err(err) => Ok(error_response(&err)),
                    }
                }
                Method::PUT => {
                    let (org_id, object_type, object_id) =
                        (org_id.clone(), object_type.clone(), object_id.clone());
                    let body = req.into_body().collect().await?.to_bytes();
                    let payload: ObjectUpdatePayload = match serde_json::from_slice(&body) {
                        Ok(payload) => payload,
                        Err(err) => {
                            debug!("invalid object update payload: {}", err);
                            return Ok(status_only(StatusCode::BAD_REQUEST));
                        }
                    };
                    if !can_user_create_object(
                        service.store(),
                        caller.code,
                        &caller.org,
                        &caller.username,
                        &org_id,
                        &payload.meta,
                    )
                    .await
                    {
                        return Ok(forbidden());
                    }
                    match service
                        .update_object(&org_id, &object_type, &object_id, payload.meta, payload.data)
                        .await
                    {
                        Ok(()) => Ok(status_only(StatusCode::OK)),
                        Err(err) => Ok(error_response(&err)),
                    }
                }
                _ => Ok(status_only(StatusCode::METHOD_NOT_ALLOWED)),
            }
        }

        // /objects/{orgID}/{type}/{id}/{operation}
        4 => {
            let (org_id, object_type, object_id) = (&rest[0], &rest[1], &rest[2]);
            if !can_user_access_object(
                service.store(),
                caller.code,
                &caller.org,
                &caller.username,
                org_id,
                object_type,
            )
            .await
            {
                return Ok(forbidden());
            }
            handle_object_operation(service, req, org_id, object_type, object_id, &rest[3]).await
        }

        _ => Ok(status_only(StatusCode::BAD_REQUEST)),
    }
}

async fn handle_object_operation(
    service: Arc<SyncService>,
    req: Request<Incoming>,
    org_id: &str,
    object_type: &str,
    object_id: &str,
    operation: &str,
) -> Result<ApiResponse, hyper::Error> {
    let method = req.method().clone();
    let operation = operation.to_lowercase();
    match (method, operation.as_str()) {
        (Method::PUT, "consumed") => {
            no_content(service.object_consumed(org_id, object_type, object_id).await)
        }
        (Method::PUT, "deleted") => {
            no_content(service.object_deleted(org_id, object_type, object_id).await)
        }
        (Method::PUT, "received") => {
            no_content(service.object_received(org_id, object_type, object_id).await)
        }
        (Method::PUT, "activate") => {
            no_content(service.activate_object(org_id, object_type, object_id).await)
        }
        (Method::GET, "status") => {
            match service.get_object_status(org_id, object_type, object_id).await {
                Ok(status) => {
                    let mut response = plain(StatusCode::OK, status.as_str().as_bytes());
                    response
                        .headers_mut()
                        .insert("Content-Type", "text/plain".parse().unwrap());
                    Ok(response)
                }
                Err(err) => Ok(error_response(&err)),
            }
        }
        (Method::GET, "destinations") => {
            match service
                .get_object_destinations_status(org_id, object_type, object_id)
                .await
            {
                Ok(destinations) => Ok(json(StatusCode::OK, &destinations)),
                Err(err) => Ok(error_response(&err)),
            }
        }
        (Method::GET, "data") => {
            match service.get_object_data(org_id, object_type, object_id).await {
                Ok(Some(mut reader)) => {
                    let mut buffer = Vec::new();
                    let read = reader.read_to_end(&mut buffer).await;
                    let closed = service.close_object_data(reader).await;
                    if read.is_err() || closed.is_err() {
                        return Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR));
                    }
                    let mut response = Response::new(Full::from(Bytes::from(buffer)));
                    response
                        .headers_mut()
                        .insert("Content-Type", "application/octet-stream".parse().unwrap());
                    Ok(response)
                }
                Ok(None) => Ok(status_only(StatusCode::NOT_FOUND)),
                Err(err) => Ok(error_response(&err)),
            }
        }
        (Method::PUT, "data") => {
            let (org_id, object_type, object_id) = (
                org_id.to_string(),
                object_type.to_string(),
                object_id.to_string(),
            );
            let body = req.into_body().collect().await?.to_bytes();
            match service
                .put_object_data(&org_id, &object_type, &object_id, body.to_vec())
                .await
            {
                Ok(true) => Ok(status_only(StatusCode::OK)),
                Ok(false) => Ok(status_only(StatusCode::NOT_FOUND)),
                Err(err) => Ok(error_response(&err)),
            }
        }
        (Method::GET, _) | (Method::PUT, _) => Ok(status_only(StatusCode::BAD_REQUEST)),
        _ => Ok(status_only(StatusCode::METHOD_NOT_ALLOWED)),
    }
}

async fn handle_organizations(
    service: Arc<SyncService>,
    req: Request<Incoming>,
    rest: Vec<String>,
) -> Result<ApiResponse, hyper::Error> {
    if !service.is_running() {
        return Ok(status_only(StatusCode::SERVICE_UNAVAILABLE));
    }
    let Some(caller) = authenticate(&service, &req).await else {
        return Ok(forbidden());
    };

    if rest.is_empty() {
        if req.method() != Method::GET {
            return Ok(status_only(StatusCode::METHOD_NOT_ALLOWED));
        }
        if !matches!(caller.code, AuthCode::Admin | AuthCode::SyncAdmin) {
            return Ok(forbidden());
        }
        return match service.list_organizations().await {
            Ok(orgs) => {
                let visible: Vec<Organization> = orgs
                    .into_iter()
                    .filter(|stored| {
                        caller.code == AuthCode::SyncAdmin || stored.org.org_id == caller.org
                    })
                    .map(|stored| stored.org)
                    .collect();
                if visible.is_empty() {
                    Ok(status_only(StatusCode::NOT_FOUND))
                } else {
                    Ok(json(StatusCode::OK, &visible))
                }
            }
            Err(err) => Ok(error_response(&err)),
        };
    }

    let org_id = rest[0].clone();
    if rest.len() > 1 {
        return Ok(status_only(StatusCode::BAD_REQUEST));
    }
    let allowed = (caller.code == AuthCode::Admin && caller.org == org_id)
        || caller.code == AuthCode::SyncAdmin;
    if !allowed {
        return Ok(forbidden());
    }

    let method = req.method().clone();
    match method {
        Method::DELETE => no_content(service.delete_organization(&org_id).await),
        Method::PUT => {
            let body = req.into_body().collect().await?.to_bytes();
            let payload: Organization = match serde_json::from_slice(&body) {
                Ok(payload) => payload,
                Err(_) => return Ok(status_only(StatusCode::BAD_REQUEST)),
            };
            no_content(service.update_organization(&org_id, payload).await)
        }
        _ => Ok(status_only(StatusCode::METHOD_NOT_ALLOWED)),
    }
}

async fn handle_security(
    service: Arc<SyncService>,
    req: Request<Incoming>,
    rest: Vec<String>,
) -> Result<ApiResponse, hyper::Error> {
    if !service.is_running() {
        return Ok(status_only(StatusCode::SERVICE_UNAVAILABLE));
    }
    let Some(caller) = authenticate(&service, &req).await else {
        return Ok(forbidden());
    };
    if caller.code != AuthCode::Admin {
        return Ok(forbidden());
    }
    if rest.len() < 2 || rest.len() > 4 {
        return Ok(status_only(StatusCode::BAD_REQUEST));
    }
    let acl_type = rest[0].clone();
    let org_id = rest[1].clone();
    if caller.org != org_id {
        return Ok(forbidden());
    }
    let tail = &rest[2..];

    let method = req.method().clone();
    match method {
        Method::GET => {
            let result = match tail.len() {
                0 => service.get_acls_in_org(&acl_type, &org_id).await,
                1 => service.get_acl(&acl_type, &org_id, &tail[0]).await,
                _ => return Ok(status_only(StatusCode::BAD_REQUEST)),
            };
            match result {
                Ok(list) if list.is_empty() => Ok(status_only(StatusCode::NOT_FOUND)),
                Ok(list) => Ok(json(StatusCode::OK, &list)),
                Err(err) => Ok(error_response(&err)),
            }
        }
        Method::DELETE => {
            if tail.len() != 2 {
                return Ok(status_only(StatusCode::BAD_REQUEST));
            }
            no_content(
                service
                    .remove_users_from_acl(&acl_type, &org_id, &tail[0], &[tail[1].clone()])
                    .await,
            )
        }
        Method::PUT => match tail.len() {
            2 => no_content(
                service
                    .add_users_to_acl(&acl_type, &org_id, &tail[0], &[tail[1].clone()])
                    .await,
            ),
            1 => {
                let key = tail[0].clone();
                let body = req.into_body().collect().await?.to_bytes();
                let payload: BulkAclUpdate = match serde_json::from_slice(&body) {
                    Ok(payload) => payload,
                    Err(_) => return Ok(status_only(StatusCode::BAD_REQUEST)),
                };
                let result = if payload.action.eq_ignore_ascii_case("add") {
                    service
                        .add_users_to_acl(&acl_type, &org_id, &key, &payload.usernames)
                        .await
                } else if payload.action.eq_ignore_ascii_case("remove") {
                    service
                        .remove_users_from_acl(&acl_type, &org_id, &key, &payload.usernames)
                        .await
                } else {
                    return Ok(status_only(StatusCode::BAD_REQUEST));
                };
                no_content(result)
            }
            _ => Ok(status_only(StatusCode::BAD_REQUEST)),
        },
        _ => Ok(status_only(StatusCode::METHOD_NOT_ALLOWED)),
    }
}

async fn handle_resend(
    service: Arc<SyncService>,
    req: Request<Incoming>,
) -> Result<ApiResponse, hyper::Error> {
    if !service.is_running() {
        return Ok(status_only(StatusCode::SERVICE_UNAVAILABLE));
    }
    let Some(caller) = authenticate(&service, &req).await else {
        return Ok(forbidden());
    };
    if !matches!(caller.code, AuthCode::Admin | AuthCode::User) {
        return Ok(forbidden());
    }
    if req.method() != Method::POST {
        return Ok(status_only(StatusCode::METHOD_NOT_ALLOWED));
    }
    no_content(service.resend_objects().await)
}

async fn handle_shutdown(
    service: Arc<SyncService>,
    req: Request<Incoming>,
) -> Result<ApiResponse, hyper::Error> {
    let Some(caller) = authenticate(&service, &req).await else {
        return Ok(forbidden());
    };
    if caller.code != AuthCode::SyncAdmin {
        return Ok(forbidden());
    }
    if req.method() != Method::POST {
        return Ok(status_only(StatusCode::METHOD_NOT_ALLOWED));
    }
    let restart = query_param(&req, "restart")
        .map(|value| value == "true" || value == "yes")
        .unwrap_or(false);
    let quiesce = query_param(&req, "quiesce")
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(3);

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        if restart {
            info!("restarting on admin request");
            if let Err(err) = service.clone().restart(quiesce).await {
                log::error!("restart failed: {}", err);
            }
        } else {
            info!("shutting down on admin request");
            service.stop(quiesce).await;
        }
    });
    Ok(status_only(StatusCode::NO_CONTENT))
}

pub(crate) struct Caller {
    pub code: AuthCode,
    pub org: String,
    pub username: String,
}

async fn authenticate(service: &Arc<SyncService>, req: &Request<Incoming>) -> Option<Caller> {
    let (username, password) = basic_auth(req)?;
    let (code, org) = service.authenticator().authenticate(&username, &password).await;
    Some(Caller {
        code,
        org,
        username,
    })
}

pub(crate) fn decode_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.as_bytes()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn basic_auth(req: &Request<Incoming>) -> Option<(String, String)> {
    let header = req.headers().get("Authorization")?.to_str().ok()?;
    decode_basic_auth(header)
}

pub(crate) fn query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    query_pairs(query)
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

fn status_only(status: StatusCode) -> ApiResponse {
    let mut response = Response::new(Full::from(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn plain(status: StatusCode, body: &[u8]) -> ApiResponse {
    let mut response = Response::new(Full::from(Bytes::copy_from_slice(body)));
    *response.status_mut() = status;
    response
}

fn forbidden() -> ApiResponse {
    plain(StatusCode::FORBIDDEN, UNAUTHORIZED)
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::from(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert("Content-Type", "application/json".parse().unwrap());
            response
        }
        Err(_) => status_only(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn no_content(result: Result<(), SyncError>) -> Result<ApiResponse, hyper::Error> {
    match result {
        Ok(()) => Ok(status_only(StatusCode::NO_CONTENT)),
        Err(err) => Ok(error_response(&err)),
    }
}

pub(crate) fn error_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::NotFound => StatusCode::NOT_FOUND,
        SyncError::InvalidRequest(_) | SyncError::Validation(_) => StatusCode::BAD_REQUEST,
        SyncError::NotRunning | SyncError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &SyncError) -> ApiResponse {
    plain(error_status(err), err.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_decodes_user_and_password() {
        let header = format!("Basic {}", STANDARD.encode("admin@org:secret"));
        let (user, password) = decode_basic_auth(&header).unwrap();
        assert_eq!(user, "admin@org");
        assert_eq!(password, "secret");
        assert!(decode_basic_auth("Bearer token").is_none());
        assert!(decode_basic_auth("Basic !!!").is_none());
    }

    #[test]
    fn query_pairs_split() {
        let pairs = query_pairs("received=true&restart=yes");
        assert_eq!(
            pairs,
            vec![
                ("received".to_string(), "true".to_string()),
                ("restart".to_string(), "yes".to_string()),
            ]
        );
    }

    #[test]
    fn error_kinds_map_to_http_statuses() {
        assert_eq!(error_status(&SyncError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            error_status(&SyncError::invalid("bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&SyncError::NotRunning),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&SyncError::internal("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
