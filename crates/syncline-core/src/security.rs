use std::sync::Arc;

use async_trait::async_trait;
use syncline_api::{AuthCode, MetaData};

use crate::error::SyncError;
use crate::store::Storage;

pub const DESTINATIONS_ACL_TYPE: &str = "destinations";
pub const OBJECTS_ACL_TYPE: &str = "objects";

/// The authentication/authorization oracle. The engine only asks questions;
/// credential verification lives outside.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the caller's auth code and organization.
    async fn authenticate(&self, username: &str, password: &str) -> (AuthCode, String);
}

/// Accepts everything. The username is "user@org" or a bare org acting as
/// admin; "edge@org" maps to an edge node. Default for tests and single-user
/// deployments.
pub struct OpenAuthenticator;

#[async_trait]
impl Authenticator for OpenAuthenticator {
    async fn authenticate(&self, username: &str, _password: &str) -> (AuthCode, String) {
        if username.is_empty() {
            return (AuthCode::Failed, String::new());
        }
        match username.split_once('@') {
            Some(("root", "")) => (AuthCode::SyncAdmin, String::new()),
            Some(("edge", org)) => (AuthCode::EdgeNode, org.to_string()),
            Some((_, org)) => (AuthCode::Admin, org.to_string()),
            None => (AuthCode::Admin, username.to_string()),
        }
    }
}

/// True when the user may read or manipulate objects of the given type.
/// Admins of the org always may; users need an objects-ACL entry, missing
/// ACL means unrestricted.
pub async fn can_user_access_object(
    store: &Arc<dyn Storage>,
    code: AuthCode,
    user_org: &str,
    username: &str,
    org_id: &str,
    object_type: &str,
) -> bool {
    match code {
        AuthCode::SyncAdmin => return true,
        AuthCode::Failed => return false,
        _ => {}
    }
    if user_org != org_id {
        return false;
    }
    if code == AuthCode::Admin {
        return true;
    }
    acl_allows(store, OBJECTS_ACL_TYPE, org_id, object_type, username).await
}

/// Object upsert additionally checks metadata-level rules: an edge node may
/// only create objects originating at itself.
pub async fn can_user_create_object(
    store: &Arc<dyn Storage>,
    code: AuthCode,
    user_org: &str,
    username: &str,
    org_id: &str,
    meta: &MetaData,
) -> bool {
    if !can_user_access_object(store, code, user_org, username, org_id, &meta.object_type).await {
        return false;
    }
    if code == AuthCode::EdgeNode && meta.destination_policy.is_some() {
        return false;
    }
    true
}

async fn acl_allows(
    store: &Arc<dyn Storage>,
    acl_type: &str,
    org_id: &str,
    key: &str,
    username: &str,
) -> bool {
    match store.retrieve_acl(acl_type, org_id, key).await {
        Ok(users) => users.iter().any(|u| u == username || u == "*"),
        Err(SyncError::NotFound) => true,
        Err(_) => false,
    }
}
