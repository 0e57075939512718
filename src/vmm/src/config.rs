// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Configuration accepted by the core: the pieces of the CLI surface that
//! feed `Machine::new`/`configure` directly. Built with the same
//! builder-then-`build()` shape as the rest of this stack, minus anything
//! that only makes sense for an out-of-scope collaborator (networking).

use std::path::PathBuf;

use crate::loader::CMDLINE_MAX_LEN;
use crate::memory::MIN_RAM_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel path does not exist: {0}")]
    KernelNotFound(PathBuf),
    #[error("--mem must be at least {min} MiB, got {got}")]
    MemoryTooSmall { min: u32, got: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

const MIN_MEM_MB: u32 = (MIN_RAM_SIZE / (1024 * 1024)) as u32;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub kernel_path: PathBuf,
    pub cmdline: String,
}

impl KernelConfig {
    pub fn new(kernel_path: PathBuf, params: Option<&str>) -> Result<Self> {
        if !kernel_path.exists() {
            return Err(Error::KernelNotFound(kernel_path));
        }

        let mut cmdline = crate::loader::CMDLINE_PREFIX.to_string();
        if let Some(params) = params {
            cmdline.push_str(params);
        }
        truncate_to_char_boundary(&mut cmdline, CMDLINE_MAX_LEN - 1);

        Ok(KernelConfig { kernel_path, cmdline })
    }
}

/// `String::truncate` panics if `max_len` falls inside a multi-byte UTF-8
/// sequence; `--params` is arbitrary user input, so the cut point is walked
/// back to the nearest character boundary at or before `max_len` instead.
fn truncate_to_char_boundary(s: &mut String, max_len: usize) {
    if s.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Configuration for one run of the core.
#[derive(Debug, Clone)]
pub struct VmmConfig {
    pub kernel: KernelConfig,
    pub kvm_dev: PathBuf,
    pub mem_mb: u32,
    pub single_step: bool,
    pub ioport_debug: bool,
}

impl VmmConfig {
    pub fn builder(kernel_path: PathBuf, mem_mb: u32) -> VmmConfigBuilder {
        VmmConfigBuilder::new(kernel_path, mem_mb)
    }

    pub fn mem_bytes(&self) -> u64 {
        self.mem_mb as u64 * 1024 * 1024
    }
}

#[derive(Debug)]
pub struct VmmConfigBuilder {
    kernel_path: PathBuf,
    mem_mb: u32,
    kvm_dev: PathBuf,
    params: Option<String>,
    single_step: bool,
    ioport_debug: bool,
}

impl VmmConfigBuilder {
    pub fn new(kernel_path: PathBuf, mem_mb: u32) -> Self {
        VmmConfigBuilder {
            kernel_path,
            mem_mb,
            kvm_dev: PathBuf::from("/dev/kvm"),
            params: None,
            single_step: false,
            ioport_debug: false,
        }
    }

    pub fn kvm_dev(mut self, path: PathBuf) -> Self {
        self.kvm_dev = path;
        self
    }

    pub fn params(mut self, params: Option<String>) -> Self {
        self.params = params;
        self
    }

    pub fn single_step(mut self, enable: bool) -> Self {
        self.single_step = enable;
        self
    }

    pub fn ioport_debug(mut self, enable: bool) -> Self {
        self.ioport_debug = enable;
        self
    }

    pub fn build(self) -> Result<VmmConfig> {
        if self.mem_mb < MIN_MEM_MB {
            return Err(Error::MemoryTooSmall { min: MIN_MEM_MB, got: self.mem_mb });
        }

        let kernel = KernelConfig::new(self.kernel_path, self.params.as_deref())?;

        Ok(VmmConfig {
            kernel,
            kvm_dev: self.kvm_dev,
            mem_mb: self.mem_mb,
            single_step: self.single_step,
            ioport_debug: self.ioport_debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_prefix_is_used_when_no_params() {
        let kernel = KernelConfig::new(PathBuf::from("Cargo.toml"), None).unwrap();
        assert_eq!(kernel.cmdline, crate::loader::CMDLINE_PREFIX);
    }

    #[test]
    fn params_are_appended_after_prefix() {
        let kernel = KernelConfig::new(PathBuf::from("Cargo.toml"), Some("quiet")).unwrap();
        assert_eq!(kernel.cmdline, format!("{}quiet", crate::loader::CMDLINE_PREFIX));
    }

    #[test]
    fn cmdline_truncation_does_not_split_a_multi_byte_char() {
        // Each '€' is 3 bytes; choosing a max_len that lands mid-character
        // used to panic `String::truncate` directly.
        let prefix_len = crate::loader::CMDLINE_PREFIX.len();
        let params = "€".repeat(4);
        let kernel = KernelConfig::new(PathBuf::from("Cargo.toml"), Some(&params)).unwrap();
        assert!(kernel.cmdline.len() <= prefix_len + params.len());
        assert!(std::str::from_utf8(kernel.cmdline.as_bytes()).is_ok());
    }

    #[test]
    fn missing_kernel_path_is_rejected() {
        let err = KernelConfig::new(PathBuf::from("/does/not/exist/kernel"), None).unwrap_err();
        assert!(matches!(err, Error::KernelNotFound(_)));
    }

    #[test]
    fn builder_rejects_memory_below_minimum() {
        let err = VmmConfig::builder(PathBuf::from("Cargo.toml"), 1).build().unwrap_err();
        assert!(matches!(err, Error::MemoryTooSmall { .. }));
    }

    #[test]
    fn builder_accepts_minimum_memory() {
        let cfg = VmmConfig::builder(PathBuf::from("Cargo.toml"), MIN_MEM_MB).build().unwrap();
        assert_eq!(cfg.mem_mb, MIN_MEM_MB);
    }
}
