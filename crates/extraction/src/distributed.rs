//! Per-process device binding and a file-backed rendezvous barrier.
//!
//! Endpoint file layout, one record per line:
//!
//! ```text
//! world_size=4
//! rank=0
//! rank=2
//! rank=1
//! rank=3
//! ready
//! ```
//!
//! Rank 0 creates the file exclusively and writes the header; every other
//! rank waits for the header and appends its own record. Once all ranks are
//! listed, rank 0 appends `ready`, and only then do the other ranks leave the
//! barrier. Readers only trust newline-terminated lines.

use std::{
    collections::BTreeSet,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use backbone::{Backbone, ParameterMap};
use candle_core::{Device, Tensor};

use crate::{
    config::{ClusterConfig, DistBackend},
    error::{ExtractionError, Result},
    inference::FeatureExtractor,
};

/// Parameter namespace of a replicated model's state dict.
pub const REPLICA_PREFIX: &str = "module.";

#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub device: Device,
}

/// Binds this process to its device and seeds it.
pub fn init_process(seed: u64, device_index: usize, backend: DistBackend) -> Result<ProcessContext> {
    let device = match backend {
        DistBackend::Nccl => Device::new_cuda(device_index).map_err(|err| {
            ExtractionError::initialization(format!(
                "nccl backend requires CUDA device {device_index}: {err}"
            ))
        })?,
        DistBackend::Gloo => Device::Cpu,
    };
    tracing::info!(
        backend = ?backend,
        device_index,
        is_cuda = device.is_cuda(),
        "device bound"
    );
    if let Err(err) = device.set_seed(seed) {
        tracing::warn!("failed to seed device RNG: {}", err);
    }
    Ok(ProcessContext { device })
}

/// Membership established by a completed rendezvous.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    endpoint: PathBuf,
}

impl ProcessGroup {
    /// Blocks until `world_size` distinct ranks have registered and rank 0
    /// has confirmed the barrier. `should_stop` is polled while waiting.
    ///
    /// On failure rank 0 removes the endpoint it created, so a relaunch does
    /// not meet a half-filled file.
    pub fn join<S>(
        cluster: &ClusterConfig,
        rank: usize,
        world_size: usize,
        should_stop: S,
    ) -> Result<Self>
    where
        S: Fn() -> bool,
    {
        if world_size == 0 || rank >= world_size {
            return Err(ExtractionError::rendezvous(format!(
                "rank {rank} is outside world size {world_size}"
            )));
        }
        let endpoint = cluster.rendezvous_path()?;
        let timeout = Duration::from_secs(cluster.rendezvous_timeout_secs);
        let poll = Duration::from_millis(cluster.poll_interval_ms);
        let deadline = Instant::now() + timeout;

        if rank == 0 {
            create_endpoint(&endpoint, world_size)?;
            if let Err(err) = await_members(&endpoint, world_size, deadline, poll, &should_stop) {
                let _ = fs::remove_file(&endpoint);
                return Err(err);
            }
            append_record(&endpoint, READY_RECORD)?;
        } else {
            let state = wait_for_header(&endpoint, world_size, deadline, poll, &should_stop)?;
            if state.ready {
                return Err(stale_endpoint(
                    &endpoint,
                    "barrier was already completed by an earlier run".to_string(),
                ));
            }
            if state.ranks.contains(&rank) {
                return Err(stale_endpoint(&endpoint, format!("rank {rank} already registered")));
            }
            append_record(&endpoint, &format!("rank={rank}"))?;
            await_ready(&endpoint, world_size, deadline, poll, &should_stop)?;
        }

        tracing::info!("process group: {} tasks, rank: {}", world_size, rank);
        Ok(Self {
            rank,
            world_size,
            endpoint,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

/// Deletes the rendezvous endpoint so a relaunch can create it again.
pub fn remove_endpoint(cluster: &ClusterConfig) -> Result<()> {
    let endpoint = cluster.rendezvous_path()?;
    match fs::remove_file(&endpoint) {
        Ok(()) => {
            tracing::info!(endpoint = %endpoint.display(), "removed rendezvous endpoint");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ExtractionError::rendezvous(format!(
            "failed to remove endpoint {}: {err}",
            endpoint.display()
        ))),
    }
}

/// Appended by rank 0 once every rank has registered.
const READY_RECORD: &str = "ready";

#[derive(Debug)]
struct EndpointState {
    world_size: usize,
    ranks: BTreeSet<usize>,
    ready: bool,
}

fn create_endpoint(endpoint: &Path, world_size: usize) -> Result<()> {
    if let Some(parent) = endpoint.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(endpoint)
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(stale_endpoint(endpoint, "file already exists".to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    file.write_all(format!("world_size={world_size}\nrank=0\n").as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn append_record(endpoint: &Path, record: &str) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(endpoint)?;
    file.write_all(format!("{record}\n").as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn wait_for_header(
    endpoint: &Path,
    world_size: usize,
    deadline: Instant,
    poll: Duration,
    should_stop: &dyn Fn() -> bool,
) -> Result<EndpointState> {
    loop {
        if let Some(state) = read_endpoint(endpoint)? {
            check_world_size(endpoint, state.world_size, world_size)?;
            return Ok(state);
        }
        check_interrupted(endpoint, should_stop)?;
        if Instant::now() >= deadline {
            return Err(ExtractionError::rendezvous(format!(
                "timed out waiting for rank 0 to create {}",
                endpoint.display()
            )));
        }
        thread::sleep(poll);
    }
}

/// Rank 0 side: waits until every rank has appended its record.
fn await_members(
    endpoint: &Path,
    world_size: usize,
    deadline: Instant,
    poll: Duration,
    should_stop: &dyn Fn() -> bool,
) -> Result<()> {
    loop {
        let state = read_member_state(endpoint, world_size)?;
        if state.ranks.len() == world_size {
            return Ok(());
        }
        check_interrupted(endpoint, should_stop)?;
        if Instant::now() >= deadline {
            return Err(ExtractionError::rendezvous(format!(
                "timed out with {} of {} ranks registered at {}",
                state.ranks.len(),
                world_size,
                endpoint.display()
            )));
        }
        thread::sleep(poll);
    }
}

/// Non-zero rank side: waits for rank 0 to confirm the full membership.
fn await_ready(
    endpoint: &Path,
    world_size: usize,
    deadline: Instant,
    poll: Duration,
    should_stop: &dyn Fn() -> bool,
) -> Result<()> {
    loop {
        if read_member_state(endpoint, world_size)?.ready {
            return Ok(());
        }
        check_interrupted(endpoint, should_stop)?;
        if Instant::now() >= deadline {
            return Err(ExtractionError::rendezvous(format!(
                "timed out waiting for rank 0 to confirm the barrier at {}; the endpoint may be stale",
                endpoint.display()
            )));
        }
        thread::sleep(poll);
    }
}

fn read_member_state(endpoint: &Path, world_size: usize) -> Result<EndpointState> {
    let state = read_endpoint(endpoint)?.ok_or_else(|| {
        ExtractionError::rendezvous(format!("endpoint {} lost its header", endpoint.display()))
    })?;
    check_world_size(endpoint, state.world_size, world_size)?;
    if let Some(&outside) = state.ranks.iter().find(|&&r| r >= world_size) {
        return Err(ExtractionError::rendezvous(format!(
            "endpoint {} lists rank {outside} outside world size {world_size}",
            endpoint.display()
        )));
    }
    Ok(state)
}

fn check_interrupted(endpoint: &Path, should_stop: &dyn Fn() -> bool) -> Result<()> {
    if should_stop() {
        return Err(ExtractionError::rendezvous(format!(
            "interrupted while waiting at {}",
            endpoint.display()
        )));
    }
    Ok(())
}

/// `Ok(None)` while the file or its header line does not exist yet.
fn read_endpoint(endpoint: &Path) -> Result<Option<EndpointState>> {
    let contents = match fs::read_to_string(endpoint) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    parse_endpoint(&contents, endpoint)
}

fn parse_endpoint(contents: &str, endpoint: &Path) -> Result<Option<EndpointState>> {
    let complete = match contents.rfind('\n') {
        Some(end) => &contents[..=end],
        None => return Ok(None),
    };
    let mut lines = complete.lines();
    let header = lines.next().unwrap_or_default();
    let world_size = parse_record(header, "world_size", endpoint)?;

    let mut ranks = BTreeSet::new();
    let mut ready = false;
    for line in lines.map(str::trim).filter(|line| !line.is_empty()) {
        if line == READY_RECORD {
            ready = true;
        } else {
            ranks.insert(parse_record(line, "rank", endpoint)?);
        }
    }
    Ok(Some(EndpointState {
        world_size,
        ranks,
        ready,
    }))
}

fn parse_record(line: &str, key: &str, endpoint: &Path) -> Result<usize> {
    line.trim()
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('='))
        .and_then(|value| value.parse::<usize>().ok())
        .ok_or_else(|| {
            ExtractionError::rendezvous(format!(
                "malformed record '{}' in endpoint {} (expected {key}=<n>)",
                line,
                endpoint.display()
            ))
        })
}

fn check_world_size(endpoint: &Path, found: usize, expected: usize) -> Result<()> {
    if found != expected {
        return Err(ExtractionError::rendezvous(format!(
            "endpoint {} was created for world size {found}, this rank expects {expected}",
            endpoint.display()
        )));
    }
    Ok(())
}

fn stale_endpoint(endpoint: &Path, reason: String) -> ExtractionError {
    ExtractionError::rendezvous(format!(
        "endpoint {} is stale or in use ({reason}); remove it before relaunching",
        endpoint.display()
    ))
}

/// A frozen backbone replicated across ranks for inference.
///
/// Its state dict carries the [`REPLICA_PREFIX`], so a saved checkpoint can
/// be fed back as pretrained weights.
#[derive(Debug)]
pub struct DistributedBackbone {
    module: Backbone,
    rank: usize,
    world_size: usize,
}

impl DistributedBackbone {
    pub fn wrap(module: Backbone, rank: usize, world_size: usize) -> Result<Self> {
        if !module.is_frozen() {
            return Err(ExtractionError::initialization(format!(
                "backbone {} must be frozen before replication",
                module.name()
            )));
        }
        Ok(Self {
            module,
            rank,
            world_size,
        })
    }

    pub fn module(&self) -> &Backbone {
        &self.module
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn state_dict(&self) -> Result<ParameterMap> {
        Ok(self
            .module
            .named_parameters()?
            .into_iter()
            .map(|(name, tensor)| (format!("{REPLICA_PREFIX}{name}"), tensor))
            .collect())
    }

    pub fn load_state_dict(&mut self, state: ParameterMap) -> Result<()> {
        let mut stripped = ParameterMap::new();
        for (name, tensor) in state {
            let Some(inner) = name.strip_prefix(REPLICA_PREFIX) else {
                return Err(ExtractionError::checkpoint(format!(
                    "parameter {name} lacks the {REPLICA_PREFIX} prefix"
                )));
            };
            stripped.insert(inner.to_string(), tensor);
        }
        self.module
            .load_parameters(stripped)
            .map_err(|err| ExtractionError::checkpoint(err.to_string()))
    }
}

impl FeatureExtractor for DistributedBackbone {
    fn set_training(&mut self, training: bool) {
        self.module.set_training(training);
    }

    fn device(&self) -> &Device {
        self.module.device()
    }

    fn embedding_dim(&self) -> usize {
        self.module.embedding_dim()
    }

    fn num_classes(&self) -> usize {
        self.module.num_classes()
    }

    fn extract(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok(self.module.forward(images)?)
    }
}
