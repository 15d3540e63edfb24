//! testbackend - demo backend for exercising the plugbay runner
//!
//! A small in-memory volume manager with a fixed-size pool. Run under a
//! supervisor it serves the framed JSON protocol on the descriptor named in
//! its argument; run any other way it falls back to a standalone listing of
//! its operation surface, which is handy during development.

use plugbay::{serve_with, Backend, DomainError, OpTable};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};

/// Size of the simulated storage pool.
const POOL_BYTES: u64 = 1 << 30;

/// Domain error codes of this backend's own error model.
mod errno {
    pub const NO_SPACE: i32 = 50;
    pub const NAME_IN_USE: i32 = 51;
    pub const NO_SUCH_VOLUME: i32 = 52;
}

#[derive(Debug, Clone, Serialize)]
struct Volume {
    id: u32,
    name: String,
    size_bytes: u64,
}

#[derive(Debug, Serialize)]
struct Capacity {
    total_bytes: u64,
    free_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct StartupParams {
    #[allow(dead_code)]
    uri: Option<String>,
    #[allow(dead_code)]
    password: Option<String>,
    #[allow(dead_code)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    name: String,
    size_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    id: u32,
}

struct VolumeBackend {
    volumes: Vec<Volume>,
    next_id: u32,
    started: bool,
}

impl VolumeBackend {
    fn free_bytes(&self) -> u64 {
        POOL_BYTES - self.volumes.iter().map(|v| v.size_bytes).sum::<u64>()
    }

    fn create_volume(&mut self, name: String, size_bytes: u64) -> Result<Volume, DomainError> {
        if self.volumes.iter().any(|v| v.name == name) {
            return Err(DomainError::new(
                errno::NAME_IN_USE,
                format!("volume {name} already exists"),
            ));
        }
        let free = self.free_bytes();
        if size_bytes > free {
            return Err(DomainError::with_data(
                errno::NO_SPACE,
                "disk full",
                json!({"requested": size_bytes, "free": free}),
            ));
        }
        let volume = Volume {
            id: self.next_id,
            name,
            size_bytes,
        };
        self.next_id += 1;
        self.volumes.push(volume.clone());
        Ok(volume)
    }

    fn delete_volume(&mut self, id: u32) -> Result<(), DomainError> {
        let index = self
            .volumes
            .iter()
            .position(|v| v.id == id)
            .ok_or_else(|| DomainError::new(errno::NO_SUCH_VOLUME, format!("no volume with id {id}")))?;
        self.volumes.remove(index);
        Ok(())
    }
}

impl Backend for VolumeBackend {
    fn create() -> anyhow::Result<Self> {
        Ok(Self {
            volumes: Vec::new(),
            next_id: 0,
            started: false,
        })
    }

    fn operations(ops: &mut OpTable<Self>) {
        ops.register("startup", |b: &mut Self, _p: Option<StartupParams>| {
            b.started = true;
            Ok(())
        });
        ops.register("shutdown", |b: &mut Self, (): ()| Backend::shutdown(b));
        ops.register("volumes", |b: &mut Self, (): ()| Ok(b.volumes.clone()));
        ops.register("capacity", |b: &mut Self, (): ()| {
            Ok(Capacity {
                total_bytes: POOL_BYTES,
                free_bytes: b.free_bytes(),
            })
        });
        ops.register("volume_create", |b: &mut Self, p: CreateParams| {
            b.create_volume(p.name, p.size_bytes)
        });
        ops.register("volume_delete", |b: &mut Self, p: DeleteParams| {
            b.delete_volume(p.id)
        });
    }

    fn shutdown(&mut self) -> Result<(), DomainError> {
        self.started = false;
        Ok(())
    }
}

/// Standalone fallback: print the operation surface and exit.
fn standalone_listing() -> anyhow::Result<()> {
    let mut ops = OpTable::<VolumeBackend>::new();
    VolumeBackend::operations(&mut ops);
    let mut methods: Vec<&str> = ops.methods().collect();
    methods.sort_unstable();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "backend": "testbackend",
            "pool_bytes": POOL_BYTES,
            "operations": methods,
        }))?
    );
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

fn main() -> ExitCode {
    init_tracing();
    let args: Vec<String> = std::env::args().collect();
    serve_with::<VolumeBackend>(&args, Some(Box::new(standalone_listing))).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> VolumeBackend {
        VolumeBackend::create().unwrap()
    }

    #[test]
    fn creating_volumes_consumes_the_pool() {
        let mut b = backend();
        let v = b.create_volume("v0".to_string(), 1024).unwrap();
        assert_eq!(v.id, 0);
        assert_eq!(b.free_bytes(), POOL_BYTES - 1024);

        let v = b.create_volume("v1".to_string(), 1024).unwrap();
        assert_eq!(v.id, 1);
        assert_eq!(b.volumes.len(), 2);
    }

    #[test]
    fn exhausting_the_pool_is_disk_full() {
        let mut b = backend();
        let err = b.create_volume("huge".to_string(), POOL_BYTES + 1).unwrap_err();
        assert_eq!(err.code, errno::NO_SPACE);
        assert_eq!(err.message, "disk full");
        assert_eq!(err.data.as_ref().unwrap()["requested"], json!(POOL_BYTES + 1));
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut b = backend();
        b.create_volume("v0".to_string(), 16).unwrap();
        let err = b.create_volume("v0".to_string(), 16).unwrap_err();
        assert_eq!(err.code, errno::NAME_IN_USE);
    }

    #[test]
    fn deleting_returns_space_to_the_pool() {
        let mut b = backend();
        let v = b.create_volume("v0".to_string(), 4096).unwrap();
        b.delete_volume(v.id).unwrap();
        assert_eq!(b.free_bytes(), POOL_BYTES);

        let err = b.delete_volume(v.id).unwrap_err();
        assert_eq!(err.code, errno::NO_SUCH_VOLUME);
    }
}
