//! The JSON API: a thin read/auth layer over the storage reader.
//!
//! Every endpoint authenticates with an `(address, view_key)` pair; the
//! server recomputes `view_key·G` and compares it with the address's view
//! half, so the view key is both the decryption key and the bearer token.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use lws_db::{Error as DbError, Reader, Storage};
use lws_primitives::{
    crypto::commitment_from_mask,
    data::{unpack, Account, AccountStatus, Extra},
    keys::key_check,
    AccountAddress, Network, ViewKey,
};

pub struct ApiState {
    pub storage: Storage,
    pub network: Network,
    pub auto_accept_creation: bool,
}

type SharedState = Arc<ApiState>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/get_address_info", post(get_address_info))
        .route("/get_address_txs", post(get_address_txs))
        .route("/get_unspent_outs", post(get_unspent_outs))
        .with_state(Arc::new(state))
}

#[derive(Debug)]
pub(crate) struct ApiError(StatusCode, &'static str);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({"error": self.1}))).into_response()
    }
}

fn internal() -> ApiError {
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

fn db_error(e: DbError) -> ApiError {
    match e {
        DbError::NoSuchAccount => ApiError(StatusCode::NOT_FOUND, "no such account"),
        DbError::AccountExists => ApiError(StatusCode::CONFLICT, "account already exists"),
        DbError::DuplicateRequest => {
            ApiError(StatusCode::CONFLICT, "account creation already requested")
        }
        DbError::CreateQueueMax => {
            ApiError(StatusCode::TOO_MANY_REQUESTS, "creation queue is full")
        }
        DbError::BadViewKey => ApiError(StatusCode::UNAUTHORIZED, "view key does not match"),
        other => {
            error!("storage failure serving API request: {}", other);
            internal()
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct LoginRequest {
    address: String,
    view_key: String,
    #[serde(default)]
    create_account: bool,
}

#[derive(Serialize)]
pub(crate) struct LoginResponse {
    new_address: bool,
}

#[derive(Deserialize)]
pub(crate) struct AuthRequest {
    address: String,
    view_key: String,
}

#[derive(Serialize)]
pub(crate) struct AddressInfoResponse {
    total_received: u64,
    total_sent: u64,
    scanned_height: u64,
    start_height: u64,
    blockchain_height: u64,
}

#[derive(Serialize)]
pub(crate) struct AddressTxsResponse {
    total_received: u64,
    total_sent: u64,
    scanned_height: u64,
    blockchain_height: u64,
    transactions: Vec<AddressTx>,
}

/// One transaction touching the account: what it delivered and, through its
/// ring inputs, what it may have spent.
#[derive(Serialize)]
pub(crate) struct AddressTx {
    hash: String,
    height: u64,
    timestamp: u64,
    unlock_time: u64,
    total_received: u64,
    total_sent: u64,
    coinbase: bool,
    mixin: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_id: Option<String>,
    spent_outputs: Vec<SpentOutput>,
}

#[derive(Serialize)]
pub(crate) struct SpentOutput {
    output_id: u64,
    key_image: String,
    amount: u64,
    mixin: u32,
}

#[derive(Serialize)]
pub(crate) struct UnspentOutsResponse {
    amount: u64,
    outputs: Vec<UnspentOutput>,
}

#[derive(Serialize)]
pub(crate) struct UnspentOutput {
    amount: u64,
    global_index: u64,
    height: u64,
    index: u32,
    tx_hash: String,
    tx_pub_key: String,
    /// Legacy re-encoded `commitment ‖ mask ‖ amount` triplet kept for
    /// historical wallet compatibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    rct: Option<String>,
    spend_key_images: Vec<String>,
}

/// Validates the address/view-key pair and loads the account, treating
/// hidden accounts as absent.
fn authenticate(
    reader: &Reader<'_>,
    network: Network,
    address: &str,
    view_key: &str,
) -> Result<(AccountAddress, Account), ApiError> {
    let address = AccountAddress::decode(address, network)
        .map_err(|_| ApiError(StatusCode::BAD_REQUEST, "bad address"))?;
    let view_key = ViewKey::from_hex(view_key)
        .ok_or(ApiError(StatusCode::BAD_REQUEST, "bad view key"))?;
    if !key_check(&address, &view_key) {
        return Err(ApiError(StatusCode::UNAUTHORIZED, "view key does not match"));
    }
    let (status, account) = reader.get_account(&address).map_err(db_error)?;
    if status == AccountStatus::Hidden {
        return Err(ApiError(StatusCode::NOT_FOUND, "no such account"));
    }
    Ok((address, account))
}

async fn login(
    State(state): State<SharedState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    run_blocking(move || login_blocking(&state, request)).await
}

async fn get_address_info(
    State(state): State<SharedState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AddressInfoResponse>, ApiError> {
    run_blocking(move || address_info_blocking(&state, request)).await
}

async fn get_address_txs(
    State(state): State<SharedState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AddressTxsResponse>, ApiError> {
    run_blocking(move || address_txs_blocking(&state, request)).await
}

async fn get_unspent_outs(
    State(state): State<SharedState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<UnspentOutsResponse>, ApiError> {
    run_blocking(move || unspent_outs_blocking(&state, request)).await
}

async fn run_blocking<T: Send + 'static>(
    work: impl FnOnce() -> Result<T, ApiError> + Send + 'static,
) -> Result<Json<T>, ApiError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|_| internal())?
        .map(Json)
}

fn login_blocking(state: &ApiState, request: LoginRequest) -> Result<LoginResponse, ApiError> {
    let address = AccountAddress::decode(&request.address, state.network)
        .map_err(|_| ApiError(StatusCode::BAD_REQUEST, "bad address"))?;
    let view_key = ViewKey::from_hex(&request.view_key)
        .ok_or(ApiError(StatusCode::BAD_REQUEST, "bad view key"))?;
    if !key_check(&address, &view_key) {
        return Err(ApiError(StatusCode::UNAUTHORIZED, "view key does not match"));
    }

    let mut conn = state.storage.connect().map_err(db_error)?;
    match conn.start_read().map_err(db_error)?.get_account(&address) {
        Ok((AccountStatus::Hidden, _)) => {
            return Err(ApiError(StatusCode::NOT_FOUND, "no such account"))
        }
        Ok(_) => return Ok(LoginResponse { new_address: false }),
        Err(DbError::NoSuchAccount) => {}
        Err(e) => return Err(db_error(e)),
    }

    if !request.create_account {
        return Err(ApiError(StatusCode::NOT_FOUND, "no such account"));
    }

    if state.auto_accept_creation {
        conn.add_account(&address, &view_key).map_err(db_error)?;
    } else {
        conn.creation_request(&address, &view_key).map_err(db_error)?;
    }
    Ok(LoginResponse { new_address: true })
}

fn address_info_blocking(
    state: &ApiState,
    request: AuthRequest,
) -> Result<AddressInfoResponse, ApiError> {
    let mut conn = state.storage.connect().map_err(db_error)?;
    let response = {
        let reader = conn.start_read().map_err(db_error)?;
        let (_, account) =
            authenticate(&reader, state.network, &request.address, &request.view_key)?;

        let outputs = reader.get_outputs(account.id).map_err(db_error)?;
        let spends = reader.get_account_spends(account.id).map_err(db_error)?;
        let amounts: BTreeMap<u64, u64> = outputs
            .iter()
            .map(|out| (u64::from(out.id), out.amount))
            .collect();

        AddressInfoResponse {
            total_received: outputs.iter().map(|out| out.amount).sum(),
            total_sent: spends
                .iter()
                .filter_map(|record| amounts.get(&u64::from(record.output)))
                .sum(),
            scanned_height: u64::from(account.scan_height),
            start_height: u64::from(account.start_height),
            blockchain_height: u64::from(
                reader.get_last_block().map_err(db_error)?.id,
            ),
        }
    };

    // last-access stamp; failure is not worth failing the read for
    if let Ok(address) = AccountAddress::decode(&request.address, state.network) {
        let _ = conn.update_access_time(&address);
    }
    Ok(response)
}

fn address_txs_blocking(
    state: &ApiState,
    request: AuthRequest,
) -> Result<AddressTxsResponse, ApiError> {
    let mut conn = state.storage.connect().map_err(db_error)?;
    let reader = conn.start_read().map_err(db_error)?;
    let (_, account) =
        authenticate(&reader, state.network, &request.address, &request.view_key)?;

    let outputs = reader.get_outputs(account.id).map_err(db_error)?;
    let spends = reader.get_account_spends(account.id).map_err(db_error)?;
    let amounts: BTreeMap<u64, u64> = outputs
        .iter()
        .map(|out| (u64::from(out.id), out.amount))
        .collect();

    let mut transactions: Vec<AddressTx> = Vec::new();

    for out in &outputs {
        let hash = out.tx_hash.to_string();
        let (flags, pid_length) = unpack(out.extra);
        match transactions.iter_mut().find(|tx| tx.hash == hash) {
            Some(tx) => tx.total_received += out.amount,
            None => transactions.push(AddressTx {
                hash,
                height: u64::from(out.height),
                timestamp: out.timestamp,
                unlock_time: out.unlock_time,
                total_received: out.amount,
                total_sent: 0,
                coinbase: matches!(flags, Extra::Coinbase | Extra::CoinbaseAndRingct),
                mixin: out.mixin_count,
                payment_id: match pid_length {
                    8 => Some(hex::encode(out.payment_id.short())),
                    32 => Some(hex::encode(out.payment_id.0)),
                    _ => None,
                },
                spent_outputs: Vec::new(),
            }),
        }
    }

    // Each candidate spend belongs to the transaction that carried its
    // ring; a spend-only transaction gets its own entry. The spending
    // transaction's timestamp is not recorded, only its height.
    for record in &spends {
        let hash = record.tx_hash.to_string();
        let index = match transactions.iter().position(|tx| tx.hash == hash) {
            Some(index) => index,
            None => {
                transactions.push(AddressTx {
                    hash,
                    height: u64::from(record.height),
                    timestamp: 0,
                    unlock_time: 0,
                    total_received: 0,
                    total_sent: 0,
                    coinbase: false,
                    mixin: record.spend.mixin_count,
                    payment_id: None,
                    spent_outputs: Vec::new(),
                });
                transactions.len() - 1
            }
        };
        let entry = &mut transactions[index];
        let amount = amounts
            .get(&u64::from(record.output))
            .copied()
            .unwrap_or(0);
        entry.total_sent += amount;
        entry.spent_outputs.push(SpentOutput {
            output_id: u64::from(record.output),
            key_image: record.spend.key_image.to_string(),
            amount,
            mixin: record.spend.mixin_count,
        });
    }

    transactions.sort_by_key(|tx| tx.height);

    Ok(AddressTxsResponse {
        total_received: outputs.iter().map(|out| out.amount).sum(),
        total_sent: transactions.iter().map(|tx| tx.total_sent).sum(),
        scanned_height: u64::from(account.scan_height),
        blockchain_height: u64::from(reader.get_last_block().map_err(db_error)?.id),
        transactions,
    })
}

fn unspent_outs_blocking(
    state: &ApiState,
    request: AuthRequest,
) -> Result<UnspentOutsResponse, ApiError> {
    let mut conn = state.storage.connect().map_err(db_error)?;
    let reader = conn.start_read().map_err(db_error)?;
    let (_, account) =
        authenticate(&reader, state.network, &request.address, &request.view_key)?;

    let outputs = reader.get_outputs(account.id).map_err(db_error)?;
    let mut listed = Vec::with_capacity(outputs.len());
    for out in &outputs {
        let (flags, _) = unpack(out.extra);
        let ringct = matches!(flags, Extra::Ringct | Extra::CoinbaseAndRingct);

        // the candidate key images let the wallet decide which spends are
        // real; the server cannot tell
        let spend_key_images = reader
            .get_spends(out.id)
            .map_err(db_error)?
            .iter()
            .map(|spend| spend.key_image.to_string())
            .collect();

        listed.push(UnspentOutput {
            amount: out.amount,
            global_index: u64::from(out.id),
            height: u64::from(out.height),
            index: out.index_in_tx,
            tx_hash: out.tx_hash.to_string(),
            tx_pub_key: out.tx_public.to_string(),
            rct: ringct.then(|| {
                let commitment = commitment_from_mask(&out.ringct_mask, out.amount);
                let mut blob = Vec::with_capacity(72);
                blob.extend_from_slice(&commitment.0);
                blob.extend_from_slice(out.ringct_mask.as_bytes());
                blob.extend_from_slice(&out.amount.to_le_bytes());
                hex::encode(blob)
            }),
            spend_key_images,
        });
    }

    Ok(UnspentOutsResponse {
        amount: outputs.iter().map(|out| out.amount).sum(),
        outputs: listed,
    })
}
