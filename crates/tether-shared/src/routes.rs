//! HTTP routes shared by the client transfer layer and the file host.

use crate::error::SharedError;

pub const FILES_SEND: &str = "/files/filesSend";
pub const FILES_UPLOAD: &str = "/files/upload";
pub const FILES_UPLOAD_MUNGED: &str = "/files/uploadMunged";
pub const FILES_DELETE_ALL: &str = "/files/deleteAll";

pub const AUTH_CREATE_IDENT: &str = "/auth/createWithIdent";
pub const AUTH_CREATE_IDENT_OAUTH: &str = "/auth/createWithIdentOAuth";
pub const AUTH_RENEW_TOKEN: &str = "/auth/renewToken";

pub const HUB_PATH: &str = "/sync";

fn join(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

pub fn files_send(cdn: &str) -> String {
    join(cdn, FILES_SEND)
}

pub fn files_upload(cdn: &str, hash: &str) -> String {
    format!("{}/{}", join(cdn, FILES_UPLOAD), hash)
}

pub fn files_upload_munged(cdn: &str, hash: &str) -> String {
    format!("{}/{}", join(cdn, FILES_UPLOAD_MUNGED), hash)
}

pub fn files_delete_all(cdn: &str) -> String {
    join(cdn, FILES_DELETE_ALL)
}

pub fn auth_create_ident(api: &str) -> String {
    join(api, AUTH_CREATE_IDENT)
}

pub fn auth_create_ident_oauth(api: &str) -> String {
    join(api, AUTH_CREATE_IDENT_OAUTH)
}

pub fn auth_renew_token(api: &str) -> String {
    join(api, AUTH_RENEW_TOKEN)
}

/// Hub endpoint derived from a server's configured URI. `https` becomes
/// `wss`, `http` becomes `ws`; websocket schemes pass through.
pub fn hub_uri(server_uri: &str) -> String {
    let base = if let Some(rest) = server_uri.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_uri.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server_uri.to_string()
    };
    join(&base, HUB_PATH)
}

/// API base (http/https) derived from a server's configured URI.
pub fn api_uri(server_uri: &str) -> String {
    if let Some(rest) = server_uri.strip_prefix("wss://") {
        format!("https://{}", rest.trim_end_matches('/'))
    } else if let Some(rest) = server_uri.strip_prefix("ws://") {
        format!("http://{}", rest.trim_end_matches('/'))
    } else {
        server_uri.trim_end_matches('/').to_string()
    }
}

/// Content hashes are hex digests; anything else is rejected before it
/// reaches a URL or a file name.
pub fn validate_hash(hash: &str) -> Result<(), SharedError> {
    if hash.is_empty() || hash.len() > 128 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SharedError::InvalidHash(hash.to_string()));
    }
    Ok(())
}
