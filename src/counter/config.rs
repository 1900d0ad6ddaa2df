//! Raw configuration string grammar (spec §4.B, §6).
//!
//! Hand-rolled tokenizer rather than a parser-combinator dependency: the
//! grammar is a flat, order-independent comma-separated token list, which a
//! regex/combinator crate would be overkill for (§X.3).

use std::collections::BTreeMap;

use crate::error::{PmcError, PmcResult};
use crate::pmu::CoreTypeId;

/// Per-counter settings accumulated from tokens naming the same index.
/// Repeated tokens for one counter overwrite (spec §6).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterCfg {
    /// `Some(selector)` for a general-purpose counter (`pmcN=HEX`);
    /// `None` for a fixed-function counter (bare `pmcN`).
    pub selector: Option<u64>,
    pub usr: Option<bool>,
    pub os: Option<bool>,
    pub umask: Option<u64>,
    pub cmask: Option<u64>,
    pub edge: Option<u64>,
    pub inv: Option<u64>,
    pub any: Option<u64>,
}

/// One parsed experiment: the counters it claims, its (at most one) EBS
/// arm, and an optional core-type restriction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawExperiment {
    pub counters: BTreeMap<u8, CounterCfg>,
    pub ebs: Option<(u8, u64)>,
    pub core_type: Option<u16>,
}

fn parse_value(s: &str) -> PmcResult<u64> {
    let trimmed = s.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        trimmed.parse::<u64>()
    };
    parsed.map_err(|_| PmcError::ConfigRejected(format!("not a number: {trimmed:?}")))
}

fn parse_bit(s: &str) -> PmcResult<bool> {
    match parse_value(s)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(PmcError::ConfigRejected(format!(
            "expected 0 or 1, got {other}"
        ))),
    }
}

/// Splits a `<prefix><digits>` key into the prefix and the parsed index,
/// trying each candidate prefix longest-first so `os` doesn't swallow
/// `osN` when `usrN` is also a candidate (prefixes here don't actually
/// overlap, but the longest-match discipline keeps the grammar easy to
/// extend).
fn split_indexed(key: &str, prefixes: &[&'static str]) -> Option<(&'static str, u8)> {
    let mut candidates: Vec<&'static str> = prefixes.to_vec();
    candidates.sort_by_key(|p| std::cmp::Reverse(p.len()));
    for &prefix in &candidates {
        if let Some(rest) = key.strip_prefix(prefix) {
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(idx) = rest.parse::<u8>() {
                    return Some((prefix, idx));
                }
            }
        }
    }
    None
}

const INDEXED_PREFIXES: &[&str] = &[
    "pmc", "usr", "os", "umask", "cmask", "edge", "inv", "any", "ebs",
];

fn apply_token(exp: &mut RawExperiment, token: &str) -> PmcResult<()> {
    let token = token.trim();
    if token.is_empty() {
        return Ok(());
    }

    let (key, value) = match token.split_once('=') {
        Some((k, v)) => (k, Some(v)),
        None => (token, None),
    };

    if key == "coretype" {
        let v = value.ok_or_else(|| PmcError::ConfigRejected("coretype needs a value".into()))?;
        exp.core_type = Some(parse_value(v)? as u16);
        return Ok(());
    }

    let (prefix, idx) = split_indexed(key, INDEXED_PREFIXES)
        .ok_or_else(|| PmcError::ConfigRejected(format!("unrecognized token: {token:?}")))?;

    match prefix {
        "pmc" => {
            let cfg = exp.counters.entry(idx).or_default();
            cfg.selector = match value {
                Some(v) => Some(parse_value(v)?),
                None => None,
            };
        }
        "usr" => {
            let v = value.ok_or_else(|| PmcError::ConfigRejected("usrN needs 0/1".into()))?;
            exp.counters.entry(idx).or_default().usr = Some(parse_bit(v)?);
        }
        "os" => {
            let v = value.ok_or_else(|| PmcError::ConfigRejected("osN needs 0/1".into()))?;
            exp.counters.entry(idx).or_default().os = Some(parse_bit(v)?);
        }
        "umask" => {
            let v = value.ok_or_else(|| PmcError::ConfigRejected("umaskN needs a value".into()))?;
            exp.counters.entry(idx).or_default().umask = Some(parse_value(v)?);
        }
        "cmask" => {
            let v = value.ok_or_else(|| PmcError::ConfigRejected("cmaskN needs a value".into()))?;
            exp.counters.entry(idx).or_default().cmask = Some(parse_value(v)?);
        }
        "edge" => {
            let v = value.unwrap_or("1");
            exp.counters.entry(idx).or_default().edge = Some(parse_value(v)?);
        }
        "inv" => {
            let v = value.unwrap_or("1");
            exp.counters.entry(idx).or_default().inv = Some(parse_value(v)?);
        }
        "any" => {
            let v = value.unwrap_or("1");
            exp.counters.entry(idx).or_default().any = Some(parse_value(v)?);
        }
        "ebs" => {
            let v = value.ok_or_else(|| PmcError::ConfigRejected("ebsN needs a count".into()))?;
            if exp.ebs.is_some() {
                return Err(PmcError::ConfigRejected(
                    "at most one ebsN token per experiment".into(),
                ));
            }
            exp.ebs = Some((idx, parse_value(v)?));
        }
        _ => unreachable!("split_indexed only returns known prefixes"),
    }

    Ok(())
}

fn parse_experiment(s: &str) -> PmcResult<RawExperiment> {
    let mut exp = RawExperiment::default();
    for token in s.split(',') {
        apply_token(&mut exp, token)?;
    }
    if exp.counters.is_empty() {
        return Err(PmcError::ConfigRejected(
            "experiment declares no counters".into(),
        ));
    }
    if let Some((idx, _)) = exp.ebs {
        if !exp.counters.contains_key(&idx) {
            return Err(PmcError::ConfigRejected(format!(
                "ebs{idx} arms a counter not declared by pmc{idx}"
            )));
        }
    }
    Ok(exp)
}

/// Maximum length of one raw configuration string (spec §6).
pub const MAX_CONFIG_LEN: usize = 512;

/// Parses a full raw configuration: one or more `;`-separated experiments,
/// each a comma-separated token list (spec §4.B, exercised in spec §8
/// scenario 2 as `pmc0,pmc1;pmc2,pmc3`).
pub fn parse_experiment_set(s: &str) -> PmcResult<Vec<RawExperiment>> {
    if s.len() > MAX_CONFIG_LEN {
        return Err(PmcError::ConfigRejected(format!(
            "configuration string exceeds {MAX_CONFIG_LEN} bytes"
        )));
    }
    let experiments: Vec<RawExperiment> = s
        .split(';')
        .map(parse_experiment)
        .collect::<PmcResult<_>>()?;

    let ebs_experiments = experiments.iter().filter(|e| e.ebs.is_some()).count();
    if ebs_experiments > 0 && experiments.len() > 1 {
        return Err(PmcError::ConfigRejected(
            "EBS cannot be combined with multiplexing: an EBS-armed experiment must be the only experiment in its set".into(),
        ));
    }

    Ok(experiments)
}

fn token_sort_key(t: &str) -> String {
    t.to_string()
}

fn serialize_experiment(exp: &RawExperiment) -> String {
    let mut tokens = Vec::new();
    for (&idx, cfg) in &exp.counters {
        match cfg.selector {
            Some(v) => tokens.push(format!("pmc{idx}={v:#x}")),
            None => tokens.push(format!("pmc{idx}")),
        }
        if let Some(v) = cfg.usr {
            tokens.push(format!("usr{idx}={}", v as u8));
        }
        if let Some(v) = cfg.os {
            tokens.push(format!("os{idx}={}", v as u8));
        }
        if let Some(v) = cfg.umask {
            tokens.push(format!("umask{idx}={v:#x}"));
        }
        if let Some(v) = cfg.cmask {
            tokens.push(format!("cmask{idx}={v:#x}"));
        }
        if let Some(v) = cfg.edge {
            tokens.push(format!("edge{idx}={v:#x}"));
        }
        if let Some(v) = cfg.inv {
            tokens.push(format!("inv{idx}={v:#x}"));
        }
        if let Some(v) = cfg.any {
            tokens.push(format!("any{idx}={v:#x}"));
        }
    }
    if let Some((idx, count)) = exp.ebs {
        tokens.push(format!("ebs{idx}={count}"));
    }
    if let Some(ct) = exp.core_type {
        tokens.push(format!("coretype={ct}"));
    }
    tokens.sort_by_key(|t| token_sort_key(t));
    tokens.join(",")
}

/// Inverse of [`parse_experiment_set`], normalized: tokens within each
/// experiment are lexicographically sorted (spec §8 property 1).
pub fn serialize_experiment_set(experiments: &[RawExperiment]) -> String {
    experiments
        .iter()
        .map(serialize_experiment)
        .collect::<Vec<_>>()
        .join(";")
}

impl From<CoreTypeId> for u16 {
    fn from(c: CoreTypeId) -> u16 {
        c.0
    }
}
