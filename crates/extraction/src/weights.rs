//! Prefixed pretrained-weight loading with strict coverage.
//!
//! Pretrained files store parameters under a namespace prefix (`module.` for
//! weights saved from a replicated model). Every target parameter must find
//! its prefixed counterpart; extra source keys such as `num_batches_tracked`
//! are ignored.

use std::path::Path;

use backbone::{Backbone, ParameterMap};
use candle_core::Device;

use crate::error::{ExtractionError, Result};

pub const DEFAULT_WEIGHT_PREFIX: &str = "module.";

/// Missing keys listed in a coverage error before the rest is elided.
const MAX_REPORTED_MISSING: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coverage {
    pub matched: usize,
    pub total: usize,
}

impl Coverage {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.matched as f64 / self.total as f64
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.matched == self.total
    }
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub coverage: Coverage,
    /// Target names without a prefixed source entry, sorted.
    pub missing: Vec<String>,
}

/// Copies `source[prefix + name]` into `target[name]` for every target name
/// that has a source entry. Unmatched targets keep their value.
pub fn copy_prefixed(
    target: &mut ParameterMap,
    source: &ParameterMap,
    prefix: &str,
) -> Result<LoadReport> {
    let total = target.len();
    let mut matched = 0;
    let mut missing = Vec::new();

    for (name, current) in target.iter_mut() {
        let key = format!("{prefix}{name}");
        let Some(incoming) = source.get(&key) else {
            missing.push(name.clone());
            continue;
        };
        if incoming.dims() != current.dims() {
            return Err(ExtractionError::initialization(format!(
                "pretrained tensor {key} has shape {:?}, model expects {:?}",
                incoming.dims(),
                current.dims()
            )));
        }
        *current = if incoming.dtype() == current.dtype() {
            incoming.clone()
        } else {
            incoming.to_dtype(current.dtype())?
        };
        matched += 1;
    }

    Ok(LoadReport {
        coverage: Coverage { matched, total },
        missing,
    })
}

pub fn ensure_complete(report: &LoadReport) -> Result<()> {
    if report.coverage.is_complete() {
        return Ok(());
    }
    let mut missing = report
        .missing
        .iter()
        .take(MAX_REPORTED_MISSING)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if report.missing.len() > MAX_REPORTED_MISSING {
        missing.push_str(&format!(
            ", ... ({} more)",
            report.missing.len() - MAX_REPORTED_MISSING
        ));
    }
    Err(ExtractionError::WeightCoverage {
        matched: report.coverage.matched,
        total: report.coverage.total,
        missing,
    })
}

/// Reads a safetensors file on the CPU and loads it into `model`.
pub fn load_pretrained(model: &mut Backbone, path: &Path, prefix: &str) -> Result<Coverage> {
    let source: ParameterMap = candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|err| {
            ExtractionError::initialization(format!(
                "failed to read pretrained weights {}: {}",
                path.display(),
                err
            ))
        })?
        .into_iter()
        .collect();
    load_into(model, &source, prefix)
}

pub fn load_into(model: &mut Backbone, source: &ParameterMap, prefix: &str) -> Result<Coverage> {
    let mut params = model.named_parameters()?;
    let report = copy_prefixed(&mut params, source, prefix)?;
    tracing::info!(
        matched = report.coverage.matched,
        total = report.coverage.total,
        "load {:.1} %",
        report.coverage.percent()
    );
    ensure_complete(&report)?;
    model.load_parameters(params)?;
    Ok(report.coverage)
}
