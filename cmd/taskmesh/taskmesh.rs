mod cli;

use clap::Parser;
use secp256k1::{rand, SecretKey};
use serde::Deserialize;
use std::process::ExitCode;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use taskmesh_blockchain::{
    AuthorityFinalizationObserver, AuthorityManager, BlockTree, BroadcastGossiper, PoolLimits,
    PoolModerator, StructuralValidator, TransactionPool,
};
use taskmesh_common::{Authority, AuthorityId, AuthorityList, BlockInfo, H256};
use taskmesh_ledger::{Account, ProcessingTaskQueue, TransactionManager};
use taskmesh_storage::{BlockHeaderRepository, BlockStorage, InMemoryKvStore, StoreError};
use taskmesh_trie::{InMemoryTrieBackend, TrieBatchMut, TrieSerializer, TrieStorage};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SYNC_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct GenesisConfig {
    name: String,
    net_id: u16,
    authorities: Vec<GenesisAuthority>,
    #[serde(default)]
    state: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct GenesisAuthority {
    id: String,
    weight: u64,
}

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("genesis mismatch")]
    GenesisMismatch,
    #[error("io: {0}")]
    Io(String),
}

impl StartupError {
    fn exit_code(&self) -> ExitCode {
        match self {
            StartupError::Config(_) => ExitCode::from(1),
            StartupError::GenesisMismatch => ExitCode::from(2),
            StartupError::Io(_) => ExitCode::from(3),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let options = cli::Options::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&options.verbosity)),
        )
        .init();

    match run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "startup failed");
            err.exit_code()
        }
    }
}

async fn run(options: cli::Options) -> Result<(), StartupError> {
    let genesis_config = load_genesis(&options.genesis)?;
    info!(chain = %genesis_config.name, net = genesis_config.net_id, "starting node");

    // Components are constructed in dependency order; every arrow in the
    // ownership graph points from later lines to earlier ones.
    let db = Arc::new(InMemoryKvStore::new());
    let headers = Arc::new(BlockHeaderRepository::new(db.clone()));

    let state_root = seed_state(&genesis_config)?;
    let authorities = parse_authorities(&genesis_config)?;
    let storage = open_storage(state_root, &authorities, db.clone(), headers.clone())?;
    let genesis_hash = storage
        .genesis_block_hash()
        .map_err(|err| StartupError::Io(err.to_string()))?;

    let authority_manager = Arc::new(
        AuthorityManager::load_or_init(
            db.clone(),
            BlockInfo::new(0, genesis_hash),
            authorities,
        )
        .map_err(|err| StartupError::Io(err.to_string()))?,
    );

    let mut block_tree =
        BlockTree::new(storage.clone()).map_err(|err| StartupError::Io(err.to_string()))?;
    block_tree.add_observer(Arc::new(AuthorityFinalizationObserver::new(
        authority_manager.clone(),
    )));
    let block_tree = Arc::new(RwLock::new(block_tree));

    let _gossiper = Arc::new(BroadcastGossiper::default());
    let _pool = Arc::new(TransactionPool::new(
        Arc::new(PoolModerator::default()),
        Box::new(StructuralValidator),
        headers,
        PoolLimits::default(),
    ));

    let node_key = SecretKey::new(&mut rand::thread_rng());
    let account = Account::new(node_key, 0);
    info!(address = %account.address, "node account");
    let manager = Arc::new(TransactionManager::new(
        db.clone(),
        storage,
        account,
        genesis_config.net_id,
        None,
    ));
    let sync_handle = manager.spawn_sync_loop(SYNC_PERIOD);

    let _task_queue = Arc::new(ProcessingTaskQueue::new(
        db,
        ProcessingTaskQueue::DEFAULT_PROCESSING_TIMEOUT,
    ));

    let finalized = block_tree
        .read()
        .map(|tree| tree.get_last_finalized())
        .unwrap_or_default();
    info!(
        genesis = %genesis_hash,
        finalized = %finalized.hash,
        p2p_port = options.p2p_port,
        rpc_http = %options.rpc_http_endpoint,
        rpc_ws = %options.rpc_ws_endpoint,
        "node started"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| StartupError::Io(err.to_string()))?;
    info!("shutting down");
    sync_handle.abort();
    Ok(())
}

fn load_genesis(path: &std::path::Path) -> Result<GenesisConfig, StartupError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| StartupError::Config(format!("cannot read genesis file: {err}")))?;
    serde_json::from_str(&raw)
        .map_err(|err| StartupError::Config(format!("malformed genesis file: {err}")))
}

fn parse_authorities(config: &GenesisConfig) -> Result<AuthorityList, StartupError> {
    config
        .authorities
        .iter()
        .map(|authority| {
            let raw = hex::decode(authority.id.trim_start_matches("0x"))
                .map_err(|err| StartupError::Config(format!("bad authority id: {err}")))?;
            let id: [u8; 32] = raw
                .try_into()
                .map_err(|_| StartupError::Config("authority id must be 32 bytes".into()))?;
            Ok(Authority {
                id: AuthorityId(id),
                weight: authority.weight,
            })
        })
        .collect::<Result<_, _>>()
        .map(AuthorityList)
}

/// Builds the genesis state trie from the configured entries and returns its
/// root.
fn seed_state(config: &GenesisConfig) -> Result<H256, StartupError> {
    let backend = Arc::new(InMemoryTrieBackend::new());
    let serializer = Arc::new(TrieSerializer::new(backend));
    let state = TrieStorage::empty(serializer, None);
    let mut batch = state
        .persistent_batch()
        .map_err(|err| StartupError::Io(err.to_string()))?;
    for (key, value) in &config.state {
        let key = hex::decode(key.trim_start_matches("0x"))
            .map_err(|err| StartupError::Config(format!("bad state key: {err}")))?;
        let value = hex::decode(value.trim_start_matches("0x"))
            .map_err(|err| StartupError::Config(format!("bad state value: {err}")))?;
        batch
            .put(&key, value)
            .map_err(|err| StartupError::Io(err.to_string()))?;
    }
    batch
        .commit()
        .map_err(|err| StartupError::Io(err.to_string()))
}

fn open_storage(
    state_root: H256,
    authorities: &AuthorityList,
    db: Arc<InMemoryKvStore>,
    headers: Arc<BlockHeaderRepository>,
) -> Result<Arc<BlockStorage>, StartupError> {
    match BlockStorage::create_with_genesis(state_root, authorities, db.clone(), headers.clone()) {
        Ok(storage) => Ok(Arc::new(storage)),
        Err(StoreError::GenesisBlockAlreadyExists) => {
            let storage = BlockStorage::load_existing(db, headers)
                .map_err(|err| StartupError::Io(err.to_string()))?;
            let stored = storage
                .authority_set()
                .map_err(|err| StartupError::Io(err.to_string()))?;
            if stored != *authorities {
                return Err(StartupError::GenesisMismatch);
            }
            Ok(Arc::new(storage))
        }
        Err(err) => Err(StartupError::Io(err.to_string())),
    }
}
