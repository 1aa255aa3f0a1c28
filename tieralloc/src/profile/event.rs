//! Event-name encoding: turns a textual PMU event name into the
//! `(type, config)` pair `perf_event_open` wants. Resolution goes through
//! the kernel's sysfs event-source tree, so IMC uncore events
//! (`uncore_imc_0::UNC_M_CAS_COUNT.RD` style) and core events resolve the
//! same way. Raw `r<hex>` codes bypass the lookup entirely.

use std::fs;
use std::path::PathBuf;

use crate::error::ProfileError;
use crate::profile::sys::PERF_TYPE_RAW;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventEncoding {
    pub type_id: u32,
    pub config: u64,
}

pub trait EventEncoder: Send + Sync {
    fn encode(&self, name: &str) -> Result<EventEncoding, ProfileError>;
}

/// The production encoder, backed by `/sys/bus/event_source/devices`.
pub struct SysfsEventEncoder {
    root: PathBuf,
}

impl SysfsEventEncoder {
    pub fn new() -> Self {
        SysfsEventEncoder { root: PathBuf::from("/sys/bus/event_source/devices") }
    }

    #[cfg(test)]
    fn with_root(root: &std::path::Path) -> Self {
        SysfsEventEncoder { root: root.to_path_buf() }
    }

    fn pmu_type(&self, pmu: &str) -> Result<u32, String> {
        let path = self.root.join(pmu).join("type");
        let text = fs::read_to_string(&path).map_err(|e| format!("{}: {e}", path.display()))?;
        text.trim().parse().map_err(|_| format!("bad PMU type in {}", path.display()))
    }

    fn field_range(&self, pmu: &str, field: &str) -> Option<(u32, u32)> {
        let path = self.root.join(pmu).join("format").join(field);
        let text = fs::read_to_string(path).ok()?;
        parse_format_spec(text.trim())
    }
}

impl Default for SysfsEventEncoder {
    fn default() -> Self {
        SysfsEventEncoder::new()
    }
}

impl EventEncoder for SysfsEventEncoder {
    fn encode(&self, name: &str) -> Result<EventEncoding, ProfileError> {
        let fail = |reason: String| ProfileError::EventEncoding { name: name.to_owned(), reason };

        if let Some(hex) = name.strip_prefix('r') {
            if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
                let config = u64::from_str_radix(hex, 16)
                    .map_err(|_| fail("raw code out of range".into()))?;
                return Ok(EventEncoding { type_id: PERF_TYPE_RAW, config });
            }
        }

        let (pmu, event) = match name.split_once("::") {
            Some((pmu, event)) => (pmu, event),
            None => ("cpu", name),
        };

        let type_id = self.pmu_type(pmu).map_err(fail)?;
        let path = self.root.join(pmu).join("events").join(event);
        let terms =
            fs::read_to_string(&path).map_err(|e| fail(format!("{}: {e}", path.display())))?;
        let config = encode_terms(terms.trim(), |field| {
            self.field_range(pmu, field).or_else(|| default_field_range(field))
        })
        .map_err(fail)?;

        Ok(EventEncoding { type_id, config })
    }
}

/// A sysfs format spec such as `config:0-7` or `config:18`. Only the
/// primary config word is supported.
fn parse_format_spec(spec: &str) -> Option<(u32, u32)> {
    let bits = spec.strip_prefix("config:")?;
    match bits.split_once('-') {
        Some((lo, hi)) => Some((lo.parse().ok()?, hi.parse().ok()?)),
        None => {
            let bit = bits.parse().ok()?;
            Some((bit, bit))
        }
    }
}

/// Field positions every x86 core and uncore PMU shares, used when a PMU
/// does not publish a format directory.
fn default_field_range(field: &str) -> Option<(u32, u32)> {
    match field {
        "event" => Some((0, 7)),
        "umask" => Some((8, 15)),
        "edge" => Some((18, 18)),
        "any" => Some((21, 21)),
        "inv" => Some((23, 23)),
        "cmask" => Some((24, 31)),
        _ => None,
    }
}

/// Folds `event=0x2e,umask=0x4f`-style term lists into a config word.
/// A bare term counts as 1.
fn encode_terms(
    terms: &str,
    field_range: impl Fn(&str) -> Option<(u32, u32)>,
) -> Result<u64, String> {
    let mut config = 0u64;
    for term in terms.split(',') {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }
        let (field, value) = match term.split_once('=') {
            Some((f, v)) => (f, parse_number(v).ok_or_else(|| format!("bad value in {term:?}"))?),
            None => (term, 1),
        };
        let (lo, hi) =
            field_range(field).ok_or_else(|| format!("unknown event field {field:?}"))?;
        let width = hi - lo + 1;
        let mask = if width >= 64 { u64::MAX } else { (1 << width) - 1 };
        config |= (value & mask) << lo;
    }
    Ok(config)
}

fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn format_specs() {
        assert_eq!(parse_format_spec("config:0-7"), Some((0, 7)));
        assert_eq!(parse_format_spec("config:18"), Some((18, 18)));
        assert_eq!(parse_format_spec("config1:0-7"), None);
        assert_eq!(parse_format_spec("junk"), None);
    }

    #[test]
    fn term_encoding_with_default_layout() {
        let config = encode_terms("event=0xd0,umask=0x81", |f| default_field_range(f)).unwrap();
        assert_eq!(config, 0x81d0);

        let config = encode_terms("event=0x2e,umask=0x4f,edge", |f| default_field_range(f)).unwrap();
        assert_eq!(config, (1 << 18) | 0x4f2e);

        assert!(encode_terms("mystery=1", |f| default_field_range(f)).is_err());
    }

    #[test]
    fn raw_codes_skip_sysfs() {
        let enc = SysfsEventEncoder::new();
        assert_eq!(
            enc.encode("r81d0").unwrap(),
            EventEncoding { type_id: PERF_TYPE_RAW, config: 0x81d0 }
        );
    }

    #[test]
    fn sysfs_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let pmu = dir.path().join("uncore_imc_0");
        fs::create_dir_all(pmu.join("events")).unwrap();
        fs::create_dir_all(pmu.join("format")).unwrap();
        fs::write(pmu.join("type"), "17\n").unwrap();
        fs::write(pmu.join("events/cas_count_read"), "event=0x04,umask=0x03\n").unwrap();
        fs::write(pmu.join("format/event"), "config:0-7\n").unwrap();
        fs::write(pmu.join("format/umask"), "config:8-15\n").unwrap();

        let enc = SysfsEventEncoder::with_root(dir.path());
        assert_eq!(
            enc.encode("uncore_imc_0::cas_count_read").unwrap(),
            EventEncoding { type_id: 17, config: 0x0304 }
        );

        // Unknown PMUs and events surface as encoding errors.
        assert!(enc.encode("uncore_imc_1::cas_count_read").is_err());
        assert!(enc.encode("uncore_imc_0::nope").is_err());
    }
}
