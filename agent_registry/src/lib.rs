// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Web server that maintains a persistent registry of agent verification
//! keys.
//!
//! Key submission is self-certifying: the request signs
//! `agent_id|public_key_hex` with the key being registered, proving
//! possession of the private half. Rotation and revocation go through the
//! same registry semantics the verifier trusts (single active key, grace
//! period, never-deleted keys).

use async_std::sync::{Arc, RwLock};
use async_std::task::{sleep, spawn, JoinHandle};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::{fs, time::Duration};
use tempdir::TempDir;
use tide::{prelude::*, StatusCode};
use tollgate_core::identity::{KeyRegistry, KeyRotationPolicy, VerificationKey};

pub mod signal;

pub const DEFAULT_PORT: u16 = 50080u16;
const AGENT_REGISTRY_STARTUP_RETRIES: usize = 8;

pub trait Store: Clone + Send + Sync {
    fn save(&self, agent_id: &str, keys: &[VerificationKey]) -> Result<(), std::io::Error>;
    fn load(&self, agent_id: &str) -> Option<Vec<VerificationKey>>;
    fn list(&self) -> Vec<String>;
}

/// Persistent file backed store.
/// Each agent's keyring is stored in a single file inside `dir`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, agent_id: &str) -> PathBuf {
        let as_hex = hex::encode(agent_id.as_bytes());
        self.dir.join(format!("{}.bin", as_hex))
    }

    fn tmp_path(&self, agent_id: &str) -> PathBuf {
        let rand_string: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        self.path(agent_id).with_extension(rand_string)
    }
}

impl Store for FileStore {
    fn save(&self, agent_id: &str, keys: &[VerificationKey]) -> Result<(), std::io::Error> {
        let tmp_path = self.tmp_path(agent_id);
        fs::write(
            &tmp_path,
            bincode::serialize(&keys.to_vec()).expect("Failed to serialize keyring."),
        )?;
        fs::rename(&tmp_path, self.path(agent_id))
    }

    fn load(&self, agent_id: &str) -> Option<Vec<VerificationKey>> {
        match fs::read(self.path(agent_id)) {
            Ok(bytes) => {
                Some(bincode::deserialize(&bytes).expect("Failed to deserialize keyring."))
            }
            Err(_) => None,
        }
    }

    fn list(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!("Attempt to list store {:?} failed. {}", self.dir, err);
                return vec![];
            }
        };
        entries
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().into_string().ok()?;
                let stem = name.strip_suffix(".bin")?;
                let bytes = hex::decode(stem).ok()?;
                String::from_utf8(bytes).ok()
            })
            .collect()
    }
}

/// Non-persistent store. Suitable for testing only.
#[derive(Debug, Clone)]
pub struct TransientFileStore {
    store: FileStore,
}

impl Default for TransientFileStore {
    fn default() -> Self {
        Self {
            store: FileStore::new(
                TempDir::new("tollgate-agent-registry")
                    .expect("Failed to create temporary directory.")
                    .into_path(),
            ),
        }
    }
}

impl Drop for TransientFileStore {
    fn drop(&mut self) {
        fs::remove_dir_all(self.store.dir.clone()).expect("Failed to remove store path.");
    }
}

impl Store for TransientFileStore {
    fn save(&self, agent_id: &str, keys: &[VerificationKey]) -> Result<(), std::io::Error> {
        self.store.save(agent_id, keys)
    }

    fn load(&self, agent_id: &str) -> Option<Vec<VerificationKey>> {
        self.store.load(agent_id)
    }

    fn list(&self) -> Vec<String> {
        self.store.list()
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InsertKey {
    pub agent_id: String,
    pub public_key_hex: String,
    pub algorithm: String,
    pub expires_at: Option<u64>,
    /// Base64 Ed25519 signature over `agent_id|public_key_hex` by the key
    /// being registered.
    pub sig: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RotateKey {
    pub agent_id: String,
    pub new_public_key_hex: String,
    pub reason: String,
    /// Signed by the NEW key over `agent_id|new_public_key_hex`.
    pub sig: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RevokeKey {
    pub agent_id: String,
    pub key_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RequestKeys {
    pub agent_id: String,
}

#[derive(Clone)]
struct ServerState<T: Store> {
    registry: Arc<RwLock<KeyRegistry>>,
    store: Arc<T>,
}

pub fn agent_registry_temp_dir() -> TempDir {
    TempDir::new("tollgate-agent-registry").expect("Failed to create temporary directory.")
}

pub fn agent_registry_port() -> String {
    std::env::var("TOLLGATE_AGENT_REGISTRY_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string())
}

pub fn tollgate_data_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from("./")))
        .join("tollgate")
}

pub fn agent_registry_store_path() -> PathBuf {
    if let Ok(store_path) = std::env::var("TOLLGATE_AGENT_REGISTRY_STORE_PATH") {
        PathBuf::from(store_path)
    } else {
        tollgate_data_path().join("agent_registry").join("store")
    }
}

pub async fn init_web_server<T: Store + 'static>(
    store: T,
) -> std::io::Result<JoinHandle<std::io::Result<()>>> {
    let mut registry = KeyRegistry::new(KeyRotationPolicy::default());
    for agent_id in store.list() {
        if let Some(keys) = store.load(&agent_id) {
            registry.insert_keyring(&agent_id, keys);
        }
    }
    let mut app = tide::with_state(ServerState {
        registry: Arc::new(RwLock::new(registry)),
        store: Arc::new(store),
    });
    app.at("/insert_key").post(insert_key);
    app.at("/rotate_key").post(rotate_key);
    app.at("/revoke_key").post(revoke_key);
    app.at("/request_keys").post(request_keys);
    app.at("/healthcheck").get(healthcheck);
    let address = format!("0.0.0.0:{}", agent_registry_port());
    Ok(spawn(app.listen(address)))
}

pub async fn wait_for_server() {
    // Wait for the server to come up and start serving.
    let mut backoff = Duration::from_millis(100);
    for _ in 0..AGENT_REGISTRY_STARTUP_RETRIES {
        if surf::connect(format!("http://localhost:{}", agent_registry_port()))
            .send()
            .await
            .is_ok()
        {
            return;
        }
        sleep(backoff).await;
        backoff *= 2;
    }
    panic!("Agent registry did not start in {:?}", backoff);
}

/// Check the self-certification signature and decode the submitted key.
/// Fail with tide::StatusCode::BadRequest if decoding or the signature
/// check fail.
fn verify_possession(
    agent_id: &str,
    public_key_hex: &str,
    sig_b64: &str,
) -> Result<[u8; 32], tide::Error> {
    let bad_request =
        |msg: &str| tide::Error::from_str(StatusCode::BadRequest, msg.to_string());
    let key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|_| bad_request("public key is not hex"))?
        .try_into()
        .map_err(|_| bad_request("public key must be 32 bytes"))?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| bad_request("malformed public key"))?;
    let signature_bytes = BASE64
        .decode(sig_b64)
        .map_err(|_| bad_request("signature is not base64"))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|_| bad_request("malformed signature"))?;
    let message = format!("{}|{}", agent_id, public_key_hex);
    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| bad_request("possession signature check failed"))?;
    Ok(key_bytes)
}

/// Register a new active key for an agent.
async fn insert_key<T: Store>(
    mut req: tide::Request<ServerState<T>>,
) -> Result<tide::Response, tide::Error> {
    let insert_request: InsertKey = net::server::request_body(&mut req).await?;
    let key_bytes = verify_possession(
        &insert_request.agent_id,
        &insert_request.public_key_hex,
        &insert_request.sig,
    )?;
    let state = req.state();
    let mut registry = state.registry.write().await;
    let key = registry
        .register_key(
            &insert_request.agent_id,
            key_bytes,
            &insert_request.algorithm,
            insert_request.expires_at,
        )
        .map_err(|err| tide::Error::from_str(StatusCode::Conflict, err.to_string()))?;
    let keyring = registry
        .keyring(&insert_request.agent_id)
        .unwrap_or_default();
    state.store.save(&insert_request.agent_id, &keyring)?;
    bytes_response(&key)
}

/// Rotate to a new active key; the previous key stays valid for the grace
/// period.
async fn rotate_key<T: Store>(
    mut req: tide::Request<ServerState<T>>,
) -> Result<tide::Response, tide::Error> {
    let rotate_request: RotateKey = net::server::request_body(&mut req).await?;
    let key_bytes = verify_possession(
        &rotate_request.agent_id,
        &rotate_request.new_public_key_hex,
        &rotate_request.sig,
    )?;
    let state = req.state();
    let mut registry = state.registry.write().await;
    let key = registry
        .rotate_key(&rotate_request.agent_id, key_bytes, &rotate_request.reason)
        .map_err(|err| tide::Error::from_str(StatusCode::Conflict, err.to_string()))?;
    let keyring = registry
        .keyring(&rotate_request.agent_id)
        .unwrap_or_default();
    state.store.save(&rotate_request.agent_id, &keyring)?;
    bytes_response(&key)
}

async fn revoke_key<T: Store>(
    mut req: tide::Request<ServerState<T>>,
) -> Result<tide::Response, tide::Error> {
    let revoke_request: RevokeKey = net::server::request_body(&mut req).await?;
    let state = req.state();
    let mut registry = state.registry.write().await;
    registry
        .revoke_key(&revoke_request.agent_id, &revoke_request.key_id)
        .map_err(|err| tide::Error::from_str(StatusCode::NotFound, err.to_string()))?;
    let keyring = registry
        .keyring(&revoke_request.agent_id)
        .unwrap_or_default();
    state.store.save(&revoke_request.agent_id, &keyring)?;
    Ok(tide::Response::new(StatusCode::Ok))
}

/// Fetch the currently valid (active or rotating-in-grace) keys for an
/// agent. If the agent is unknown, return StatusCode::NotFound.
async fn request_keys<T: Store>(
    mut req: tide::Request<ServerState<T>>,
) -> Result<tide::Response, tide::Error> {
    let key_request: RequestKeys = net::server::request_body(&mut req).await?;
    let registry = req.state().registry.read().await;
    if !registry.known_agent(&key_request.agent_id) {
        return Ok(tide::Response::new(StatusCode::NotFound));
    }
    let keys = registry.get_valid_keys(&key_request.agent_id);
    bytes_response(&keys)
}

/// Bincode response body, the same framing `request_body` accepts.
fn bytes_response<T: serde::Serialize>(value: &T) -> Result<tide::Response, tide::Error> {
    let bytes = bincode::serialize(value)
        .map_err(|err| tide::Error::from_str(StatusCode::InternalServerError, err.to_string()))?;
    Ok(tide::Response::builder(StatusCode::Ok)
        .body(bytes)
        .content_type(tide::http::mime::BYTE_STREAM)
        .build())
}

/// Return a JSON expression with status 200 indicating the server
/// is up and running. The JSON expression is simply,
///    {"status": "available"}
/// When the server is running but unable to process requests
/// normally, a response with status 503 and payload {"status":
/// "unavailable"} should be added.
async fn healthcheck<T: Store>(
    mut _req: tide::Request<ServerState<T>>,
) -> Result<tide::Response, tide::Error> {
    Ok(tide::Response::builder(200)
        .content_type(tide::http::mime::JSON)
        .body(json!({"status": "available"}))
        .build())
}
