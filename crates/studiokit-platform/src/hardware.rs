use std::{path::Path, process::Command};

use serde::Serialize;
use serde_json::json;
use studiokit_observability::trace;
use sysinfo::System;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    pub vendor: String,
    pub name: String,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HardwareProfile {
    pub os: String,
    pub arch: String,
    pub cpu_brand: String,
    pub cpu_cores: usize,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub gpus: Vec<GpuInfo>,
}

impl HardwareProfile {
    pub fn total_memory_gb(&self) -> f64 {
        self.total_memory_bytes as f64 / GIB as f64
    }

    pub fn available_memory_gb(&self) -> f64 {
        self.available_memory_bytes as f64 / GIB as f64
    }

    pub fn recognition_threads(&self) -> usize {
        recognition_threads(self.cpu_cores)
    }
}

/// Thread count handed to the recognition binary.
pub fn recognition_threads(cores: usize) -> usize {
    ((cores as f64 * 0.75).floor() as usize).max(1)
}

pub fn probe(data_dir: &Path) -> HardwareProfile {
    let mut sys = System::new_all();
    sys.refresh_all();

    let cpu_brand = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let cpu_cores = match sys.cpus().len() {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        n => n,
    };

    let mut gpus = detect_nvidia_gpus();
    if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        gpus.push(GpuInfo {
            vendor: "apple".to_string(),
            name: cpu_brand.clone(),
            memory_mb: Some(sys.total_memory() / (1024 * 1024)),
        });
    }

    let profile = HardwareProfile {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_brand,
        cpu_cores,
        total_memory_bytes: sys.total_memory(),
        available_memory_bytes: sys.available_memory(),
        gpus,
    };
    trace::event(
        data_dir,
        None,
        "Hardware",
        "HW.probe",
        "ok",
        Some(json!({
            "cpu_cores": profile.cpu_cores,
            "total_memory_gb": profile.total_memory_gb(),
            "gpus": profile.gpus.len(),
        })),
    );
    profile
}

fn detect_nvidia_gpus() -> Vec<GpuInfo> {
    let out = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .output();
    match out {
        Ok(o) if o.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&o.stdout)),
        _ => Vec::new(),
    }
}

fn parse_nvidia_smi(raw: &str) -> Vec<GpuInfo> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split(',').map(str::trim);
            let name = parts.next().filter(|s| !s.is_empty())?;
            let memory_mb = parts
                .next()
                .and_then(|m| m.parse::<f64>().ok())
                .map(|m| m as u64);
            Some(GpuInfo {
                vendor: "nvidia".to_string(),
                name: name.to_string(),
                memory_mb,
            })
        })
        .collect()
}
