//! eBPF program loader
//!
//! Loads the capture object, attaches its traffic control classifiers to an
//! interface and hands out the maps the daemon reads.

use crate::merge::KernelFlowMap;
use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    programs::{tc, SchedClassifier, TcAttachType},
    Bpf,
};
use aya_log::BpfLogger;
use flow_common::constants::{EGRESS_PROGRAM, EVENTS_MAP, FLOWS_MAP, INGRESS_PROGRAM};
use log::{info, warn};
use std::path::Path;

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load the capture object from a file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the compiled eBPF object
    ///
    /// # Returns
    ///
    /// ProbeLoader instance with loaded eBPF program
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading eBPF object from: {:?}", path);

        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read eBPF object file: {:?}", path))?;
        let ebpf = Bpf::load(&data).context("Failed to load eBPF program")?;

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    /// Initialize eBPF logger
    ///
    /// Forwards kernel-side log records to the `log` facade. Non-fatal if the
    /// object was built without logging.
    pub fn init_logger(&mut self) {
        if let Err(e) = BpfLogger::init(&mut self.ebpf) {
            warn!("eBPF logger not initialized: {}", e);
        }
    }

    /// Attach the ingress and egress classifiers to `interface`
    ///
    /// Adds a clsact qdisc first; one that already exists is reused.
    pub fn attach_classifiers(&mut self, interface: &str) -> Result<()> {
        info!("Attaching classifiers to {}...", interface);

        if let Err(e) = tc::qdisc_add_clsact(interface) {
            warn!("  ⚠ clsact qdisc not added on {} (may already exist): {}", interface, e);
        }

        for (name, attach_type) in [
            (INGRESS_PROGRAM, TcAttachType::Ingress),
            (EGRESS_PROGRAM, TcAttachType::Egress),
        ] {
            let program: &mut SchedClassifier = self
                .ebpf
                .program_mut(name)
                .with_context(|| format!("{} program not found in eBPF object", name))?
                .try_into()
                .with_context(|| format!("Failed to get {} as SchedClassifier", name))?;
            program
                .load()
                .with_context(|| format!("Failed to load {}", name))?;
            program
                .attach(interface, attach_type)
                .with_context(|| format!("Failed to attach {} to {}", name, interface))?;
            info!("  ✓ Attached {} ({:?})", name, attach_type);
        }

        Ok(())
    }

    /// Take the perf event array carrying capture records
    pub fn take_event_array(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map(EVENTS_MAP)
            .with_context(|| format!("{} map not found in eBPF object", EVENTS_MAP))?;

        AsyncPerfEventArray::try_from(map)
            .with_context(|| format!("Failed to create AsyncPerfEventArray from {} map", EVENTS_MAP))
    }

    /// Take the in-kernel flow aggregation map
    pub fn take_flow_map(&mut self) -> Result<KernelFlowMap> {
        let map = self
            .ebpf
            .take_map(FLOWS_MAP)
            .with_context(|| format!("{} map not found in eBPF object", FLOWS_MAP))?;

        KernelFlowMap::new(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_object_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProbeLoader::load(&dir.path().join("connstats.o"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to read eBPF object file"));
    }

    #[test]
    fn test_load_invalid_object_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not an elf object").unwrap();

        let err = ProbeLoader::load(file.path()).err().unwrap();
        assert!(err.to_string().contains("Failed to load eBPF program"));
    }
}
