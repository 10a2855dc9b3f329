//! Build identity: which runtime and host an engine was compiled for

use std::fmt;

use serde::{Deserialize, Serialize};

/// Runtime the engines are compiled for and executed with.
///
/// tract exports no version constant, so this names the release series
/// pinned in `Cargo.toml`. Engines from another series are rejected.
pub const RUNTIME: &str = "tract-0.21";

/// Everything an engine's compiled kernels depend on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIdentity {
    pub runtime: String,
    pub crate_version: String,
    pub arch: String,
    pub os: String,
    /// SIMD features detected on the build host, sorted.
    pub cpu_features: Vec<String>,
}

impl BuildIdentity {
    /// Identity of the running binary on the current host.
    pub fn detect() -> Self {
        let mut cpu_features = detect_cpu_features();
        cpu_features.sort();
        Self {
            runtime: RUNTIME.to_string(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            cpu_features,
        }
    }

    /// Whether the host has half-precision arithmetic units.
    ///
    /// x86 `f16c` only converts between f16 and f32, so only the aarch64
    /// `fp16` extension counts.
    pub fn has_native_f16(&self) -> bool {
        self.cpu_features.iter().any(|f| f == "fp16")
    }

    /// Check that an engine built under `self` can run on `host`.
    ///
    /// Runtime, crate version, architecture and OS must match. Every CPU
    /// feature used at build time must be present on the host.
    pub fn check_compatible(&self, host: &BuildIdentity) -> Result<(), String> {
        if self.runtime != host.runtime {
            return Err(format!("runtime {} != {}", self.runtime, host.runtime));
        }
        if self.crate_version != host.crate_version {
            return Err(format!(
                "engine built by facerestore {}, running {}",
                self.crate_version, host.crate_version
            ));
        }
        if self.arch != host.arch || self.os != host.os {
            return Err(format!("{}-{} != {}-{}", self.arch, self.os, host.arch, host.os));
        }
        let missing: Vec<&str> = self
            .cpu_features
            .iter()
            .filter(|f| !host.cpu_features.contains(f))
            .map(|f| f.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(format!("host lacks cpu features {}", missing.join(",")));
        }
        Ok(())
    }
}

impl fmt::Display for BuildIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (facerestore {}) on {}-{} [{}]",
            self.runtime,
            self.crate_version,
            self.arch,
            self.os,
            self.cpu_features.join(",")
        )
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_cpu_features() -> Vec<String> {
    let mut features = Vec::new();
    if is_x86_feature_detected!("avx") {
        features.push("avx".to_string());
    }
    if is_x86_feature_detected!("avx2") {
        features.push("avx2".to_string());
    }
    if is_x86_feature_detected!("fma") {
        features.push("fma".to_string());
    }
    if is_x86_feature_detected!("f16c") {
        features.push("f16c".to_string());
    }
    if is_x86_feature_detected!("avx512f") {
        features.push("avx512f".to_string());
    }
    features
}

#[cfg(target_arch = "aarch64")]
fn detect_cpu_features() -> Vec<String> {
    let mut features = Vec::new();
    if std::arch::is_aarch64_feature_detected!("neon") {
        features.push("neon".to_string());
    }
    if std::arch::is_aarch64_feature_detected!("fp16") {
        features.push("fp16".to_string());
    }
    features
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_cpu_features() -> Vec<String> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_is_compatible_with_itself() {
        let host = BuildIdentity::detect();
        assert_eq!(host.runtime, RUNTIME);
        assert!(host.check_compatible(&host).is_ok());
    }

    #[test]
    fn test_extra_build_feature_is_incompatible() {
        let host = BuildIdentity::detect();
        let mut built = host.clone();
        built.cpu_features.push("imaginary-simd".to_string());
        let err = built.check_compatible(&host).unwrap_err();
        assert!(err.contains("imaginary-simd"));
    }

    #[test]
    fn test_fewer_build_features_is_compatible() {
        let host = BuildIdentity::detect();
        let mut built = host.clone();
        built.cpu_features.clear();
        assert!(built.check_compatible(&host).is_ok());
    }

    #[test]
    fn test_other_arch_is_incompatible() {
        let host = BuildIdentity::detect();
        let mut built = host.clone();
        built.arch = "riscv64".to_string();
        assert!(built.check_compatible(&host).is_err());
    }

    #[test]
    fn test_other_crate_version_is_incompatible() {
        let host = BuildIdentity::detect();
        let mut built = host.clone();
        built.crate_version = "9.9.9".to_string();
        let err = built.check_compatible(&host).unwrap_err();
        assert!(err.contains("9.9.9"), "{err}");
    }

    #[test]
    fn test_runtime_matches_pinned_tract() {
        let manifest = include_str!("../../Cargo.toml");
        let series = RUNTIME.strip_prefix("tract-").unwrap();
        for krate in ["tract-core", "tract-onnx", "tract-nnef"] {
            let pin = format!("{krate} = \"{series}\"");
            assert!(manifest.contains(&pin), "Cargo.toml does not pin {pin}");
        }
    }

    #[test]
    fn test_f16c_is_not_native_f16() {
        let mut identity = BuildIdentity::detect();
        identity.cpu_features = vec!["avx2".to_string(), "f16c".to_string()];
        assert!(!identity.has_native_f16());
        identity.cpu_features.push("fp16".to_string());
        assert!(identity.has_native_f16());
    }
}
