//! Accelerator, device and strategy resolution.
//!
//! Turns the user-facing `accelerator` / `devices` / `strategy` triple into a
//! concrete [`AcceleratorConnector`]. Also owns the device memory model that
//! produces the recoverable out-of-memory failures the batch size search
//! reacts to.

use std::fmt;
use std::process::Command;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TunerError};

/// Hardware backend requested for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    /// Host CPU.
    Cpu,
    /// NVIDIA GPUs.
    #[serde(alias = "gpu")]
    Cuda,
    /// Apple Metal.
    Mps,
    /// Pick the first available backend.
    #[default]
    Auto,
}

impl Accelerator {
    /// Whether this backend can run on the current machine.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Cpu | Self::Auto => true,
            Self::Cuda => cuda_device_count() > 0,
            Self::Mps => cfg!(all(target_os = "macos", target_arch = "aarch64")),
        }
    }

    /// Number of devices of this kind.
    pub fn device_count(&self) -> usize {
        match self {
            Self::Cpu | Self::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            Self::Cuda => cuda_device_count(),
            Self::Mps => usize::from(self.is_available()),
        }
    }

    fn class_name(&self) -> &'static str {
        match self {
            Self::Cpu => "CPUAccelerator",
            Self::Cuda => "CUDAAccelerator",
            Self::Mps => "MPSAccelerator",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Mps => write!(f, "mps"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for Accelerator {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            "auto" => Ok(Self::Auto),
            other => Err(TunerError::misconfig(format!(
                "You selected an invalid accelerator name: `accelerator={other:?}`. \
                 Available names are: auto, cpu, cuda, gpu, mps."
            ))),
        }
    }
}

/// Device selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawDevices", into = "RawDevices")]
pub enum Devices {
    /// One CPU, or every visible accelerator device.
    #[default]
    Auto,
    /// The first `n` devices.
    Count(usize),
    /// Every visible device (`-1`).
    All,
    /// Explicit device indices.
    Indices(Vec<usize>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawDevices {
    Int(i64),
    List(Vec<usize>),
    Str(String),
}

impl TryFrom<RawDevices> for Devices {
    type Error = TunerError;

    fn try_from(raw: RawDevices) -> Result<Self> {
        match raw {
            RawDevices::Int(-1) => Ok(Self::All),
            RawDevices::Int(n) if n > 0 => Ok(Self::Count(n as usize)),
            RawDevices::Int(n) => Err(TunerError::misconfig(format!(
                "`devices` selected with value {n}; it must be a positive integer, -1, a list or \"auto\""
            ))),
            RawDevices::List(ids) if ids.is_empty() => {
                Err(TunerError::misconfig("`devices` list must not be empty"))
            }
            RawDevices::List(ids) => Ok(Self::Indices(ids)),
            RawDevices::Str(s) => s.parse(),
        }
    }
}

impl From<Devices> for RawDevices {
    fn from(devices: Devices) -> Self {
        match devices {
            Devices::Auto => Self::Str("auto".to_string()),
            Devices::Count(n) => Self::Int(n as i64),
            Devices::All => Self::Int(-1),
            Devices::Indices(ids) => Self::List(ids),
        }
    }
}

impl FromStr for Devices {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        if s.contains(',') {
            let ids = s
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| part.trim().parse::<usize>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TunerError::misconfig(format!("invalid device index in {s:?}: {e}")))?;
            return RawDevices::List(ids).try_into();
        }
        let n: i64 = s
            .parse()
            .map_err(|_| TunerError::misconfig(format!("invalid `devices` value {s:?}")))?;
        RawDevices::Int(n).try_into()
    }
}

/// Training strategy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Single device for one device, DDP otherwise.
    #[default]
    Auto,
    /// No parallelism.
    SingleDevice,
    /// Distributed data parallel.
    Ddp,
    /// Distributed data parallel launched by spawning.
    DdpSpawn,
    /// Fully sharded data parallel.
    Fsdp,
    /// DeepSpeed ZeRO.
    #[serde(rename = "deepspeed")]
    DeepSpeed,
}

impl StrategyKind {
    /// Whether this strategy spreads work over several processes/devices.
    pub fn is_parallel(&self) -> bool {
        matches!(self, Self::Ddp | Self::DdpSpawn | Self::Fsdp | Self::DeepSpeed)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::SingleDevice => "single_device",
            Self::Ddp => "ddp",
            Self::DdpSpawn => "ddp_spawn",
            Self::Fsdp => "fsdp",
            Self::DeepSpeed => "deepspeed",
        };
        write!(f, "{name}")
    }
}

impl FromStr for StrategyKind {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "single_device" => Ok(Self::SingleDevice),
            "ddp" => Ok(Self::Ddp),
            "ddp_spawn" => Ok(Self::DdpSpawn),
            "fsdp" => Ok(Self::Fsdp),
            "deepspeed" => Ok(Self::DeepSpeed),
            other => Err(TunerError::misconfig(format!(
                "You selected an invalid strategy name: `strategy={other:?}`. \
                 Available names are: auto, single_device, ddp, ddp_spawn, fsdp, deepspeed."
            ))),
        }
    }
}

/// Resolved accelerator, devices and strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorConnector {
    accelerator: Accelerator,
    strategy: StrategyKind,
    device_ids: Vec<usize>,
}

impl AcceleratorConnector {
    /// Resolve the user selection against what this machine offers.
    pub fn new(accelerator: Accelerator, devices: &Devices, strategy: StrategyKind) -> Result<Self> {
        let accelerator = resolve_accelerator(accelerator)?;
        let device_ids = resolve_devices(accelerator, devices)?;

        let strategy = match strategy {
            StrategyKind::Auto if device_ids.len() > 1 => StrategyKind::Ddp,
            StrategyKind::Auto => StrategyKind::SingleDevice,
            StrategyKind::SingleDevice if device_ids.len() > 1 => {
                return Err(TunerError::misconfig(format!(
                    "`strategy=\"single_device\"` supports exactly one device, but {} were requested",
                    device_ids.len()
                )));
            }
            explicit => explicit,
        };

        debug!(
            accelerator = %accelerator,
            strategy = %strategy,
            devices = device_ids.len(),
            "Resolved accelerator connector"
        );

        Ok(Self {
            accelerator,
            strategy,
            device_ids,
        })
    }

    /// Concrete accelerator (never `Auto`).
    pub fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    /// Concrete strategy (never `Auto`).
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// Indices of the devices in use.
    pub fn device_ids(&self) -> &[usize] {
        &self.device_ids
    }

    /// Number of devices in use.
    pub fn num_devices(&self) -> usize {
        self.device_ids.len()
    }

    /// Whether training is spread over several ranks.
    pub fn is_distributed(&self) -> bool {
        self.strategy.is_parallel()
    }

    /// Number of data-parallel ranks.
    pub fn world_size(&self) -> usize {
        if self.is_distributed() {
            self.device_ids.len()
        } else {
            1
        }
    }
}

fn resolve_accelerator(requested: Accelerator) -> Result<Accelerator> {
    match requested {
        Accelerator::Auto => {
            let chosen = [Accelerator::Cuda, Accelerator::Mps]
                .into_iter()
                .find(Accelerator::is_available)
                .unwrap_or(Accelerator::Cpu);
            Ok(chosen)
        }
        explicit if explicit.is_available() => Ok(explicit),
        explicit => Err(TunerError::AcceleratorUnavailable(
            explicit.class_name().to_string(),
        )),
    }
}

fn resolve_devices(accelerator: Accelerator, devices: &Devices) -> Result<Vec<usize>> {
    let ids: Vec<usize> = match devices {
        Devices::Auto if accelerator == Accelerator::Cpu => vec![0],
        Devices::Auto | Devices::All => (0..accelerator.device_count().max(1)).collect(),
        Devices::Count(0) => {
            return Err(TunerError::misconfig("`devices` must be a positive integer"));
        }
        Devices::Count(n) => (0..*n).collect(),
        Devices::Indices(ids) => ids.clone(),
    };

    // CPU "devices" are processes, so any count is allowed.
    if accelerator != Accelerator::Cpu {
        let available = accelerator.device_count();
        if let Some(bad) = ids.iter().find(|&&id| id >= available) {
            return Err(TunerError::misconfig(format!(
                "You requested device {bad} on {accelerator}, but only {available} are available"
            )));
        }
    }

    Ok(ids)
}

fn cuda_device_count() -> usize {
    let output = match Command::new("nvidia-smi").arg("-L").output() {
        Ok(output) if output.status.success() => output,
        _ => return 0,
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| line.starts_with("GPU "))
        .count()
}

/// Query free memory of a CUDA device in bytes.
fn query_cuda_free_memory(device_idx: usize) -> Option<u64> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.free",
            "--format=csv,noheader,nounits",
            &format!("--id={device_idx}"),
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let mib: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some(mib * 1024 * 1024)
}

/// Memory budget of one device.
///
/// `None` capacity means unbounded (host memory, no explicit limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemory {
    capacity: Option<u64>,
}

impl DeviceMemory {
    /// A fixed budget in bytes.
    pub fn with_capacity(bytes: u64) -> Self {
        Self {
            capacity: Some(bytes),
        }
    }

    /// No budget at all.
    pub fn unbounded() -> Self {
        Self { capacity: None }
    }

    /// Budget for the first device of `connector`.
    ///
    /// An explicit `override_bytes` wins; CUDA devices fall back to the free
    /// memory reported by `nvidia-smi`; everything else is unbounded.
    pub fn detect(connector: &AcceleratorConnector, override_bytes: Option<u64>) -> Self {
        if let Some(bytes) = override_bytes {
            return Self::with_capacity(bytes);
        }
        if connector.accelerator() == Accelerator::Cuda {
            let device = connector.device_ids().first().copied().unwrap_or(0);
            if let Some(free) = query_cuda_free_memory(device) {
                info!(device, free_bytes = free, "Using CUDA free memory as device budget");
                return Self::with_capacity(free);
            }
        }
        Self::unbounded()
    }

    /// Capacity in bytes, if bounded.
    pub fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    /// Fail with [`TunerError::OutOfMemory`] if `requested` does not fit.
    pub fn allocate(&self, requested: u64, batch_size: usize) -> Result<()> {
        match self.capacity {
            Some(available) if requested > available => Err(TunerError::OutOfMemory {
                requested,
                available,
                batch_size,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accelerator() {
        assert_eq!("cpu".parse::<Accelerator>().unwrap(), Accelerator::Cpu);
        assert_eq!("GPU".parse::<Accelerator>().unwrap(), Accelerator::Cuda);
        assert!("tpu".parse::<Accelerator>().is_err());
    }

    #[test]
    fn test_parse_devices() {
        assert_eq!("auto".parse::<Devices>().unwrap(), Devices::Auto);
        assert_eq!("2".parse::<Devices>().unwrap(), Devices::Count(2));
        assert_eq!("-1".parse::<Devices>().unwrap(), Devices::All);
        assert_eq!(
            "0,1".parse::<Devices>().unwrap(),
            Devices::Indices(vec![0, 1])
        );
        assert!("0".parse::<Devices>().is_err());
        assert!("two".parse::<Devices>().is_err());
    }

    #[test]
    fn test_devices_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            devices: Devices,
        }
        let w: Wrapper = toml::from_str("devices = 4").unwrap();
        assert_eq!(w.devices, Devices::Count(4));
        let w: Wrapper = toml::from_str("devices = \"auto\"").unwrap();
        assert_eq!(w.devices, Devices::Auto);
        let w: Wrapper = toml::from_str("devices = [0, 2]").unwrap();
        assert_eq!(w.devices, Devices::Indices(vec![0, 2]));
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("ddp".parse::<StrategyKind>().unwrap(), StrategyKind::Ddp);
        assert_eq!(
            "deepspeed".parse::<StrategyKind>().unwrap(),
            StrategyKind::DeepSpeed
        );
        assert!("horovod".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_ddp_on_cpu_is_distributed() {
        let connector =
            AcceleratorConnector::new(Accelerator::Cpu, &Devices::Count(2), StrategyKind::Ddp)
                .unwrap();
        assert!(connector.is_distributed());
        assert_eq!(connector.world_size(), 2);
        assert_eq!(connector.accelerator(), Accelerator::Cpu);
    }

    #[test]
    fn test_auto_strategy_resolution() {
        let single =
            AcceleratorConnector::new(Accelerator::Cpu, &Devices::Auto, StrategyKind::Auto)
                .unwrap();
        assert_eq!(single.strategy(), StrategyKind::SingleDevice);
        assert!(!single.is_distributed());
        assert_eq!(single.world_size(), 1);

        let multi =
            AcceleratorConnector::new(Accelerator::Cpu, &Devices::Count(3), StrategyKind::Auto)
                .unwrap();
        assert_eq!(multi.strategy(), StrategyKind::Ddp);
    }

    #[test]
    fn test_single_device_rejects_many_devices() {
        let err = AcceleratorConnector::new(
            Accelerator::Cpu,
            &Devices::Count(2),
            StrategyKind::SingleDevice,
        )
        .unwrap_err();
        assert!(err.to_string().contains("single_device"));
    }

    #[test]
    fn test_device_memory_allocate() {
        let memory = DeviceMemory::with_capacity(1_000);
        assert!(memory.allocate(999, 4).is_ok());
        let err = memory.allocate(1_001, 8).unwrap_err();
        assert!(err.is_oom());
        assert!(DeviceMemory::unbounded().allocate(u64::MAX, 1).is_ok());
    }

    #[test]
    fn test_detect_prefers_override() {
        let connector =
            AcceleratorConnector::new(Accelerator::Cpu, &Devices::Auto, StrategyKind::Auto)
                .unwrap();
        assert_eq!(
            DeviceMemory::detect(&connector, Some(42)).capacity(),
            Some(42)
        );
        assert_eq!(DeviceMemory::detect(&connector, None).capacity(), None);
    }
}
