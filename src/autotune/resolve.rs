//! `resolve_winner`: the autotuner's main entry point (`spec.md` §4.6).

use std::process::Command;

use tracing::{debug, warn};

use super::cache::{make_bucket, AutotuneCache};
use super::fp16_blacklist::Fp16Blacklist;
use crate::rt::backend::DeviceCapabilities;

#[derive(Debug, Clone, Copy)]
pub struct RunArgs {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub iters: u32,
    pub batch: u32,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            m: 1024,
            n: 1024,
            k: 1024,
            iters: 30,
            batch: 100,
        }
    }
}

/// A tunable kernel variant executable.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub exe: String,
    pub requires_subgroup32: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateResult {
    pub name: String,
    pub mean_tflops: f64,
    pub raw_output: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveResult {
    pub device_key: String,
    pub bucket: String,
    pub winner: String,
    pub cache_path: String,
    pub used_cache: bool,
    pub force_winner: bool,
    pub retuned: bool,
    pub winner_tflops: f64,
    pub second_tflops: f64,
    pub results: Vec<CandidateResult>,
}

fn env_flag_true(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn is_fp16_name(name: &str) -> bool {
    name.contains("f16")
}

fn candidate_is_fp16(candidate: &Candidate) -> bool {
    is_fp16_name(&candidate.name) || is_fp16_name(&candidate.exe)
}

fn candidate_valid_for_device(candidate: &Candidate, caps: &DeviceCapabilities) -> bool {
    if !candidate.requires_subgroup32 {
        return true;
    }
    if caps.subgroup_size_min == 0 {
        return true;
    }
    caps.subgroup_size_min <= 32
}

/// Parse a `mean_TFLOPs=<float>` token out of bench output.
pub fn parse_mean_tflops(output: &str) -> Option<f64> {
    let idx = output.find("mean_TFLOPs=")?;
    let rest = &output[idx + "mean_TFLOPs=".len()..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Run one candidate's benchmark executable under the POSIX shell, merging
/// stdout/stderr, and extract its reported TFLOPs.
pub fn run_candidate_command(candidate_name: &str, command: &str) -> CandidateResult {
    let output = Command::new("/bin/sh")
        .arg("-lc")
        .arg(format!("{command} 2>&1"))
        .output();

    match output {
        Ok(output) => {
            let raw_output = String::from_utf8_lossy(&output.stdout).into_owned();
            let mean_tflops = parse_mean_tflops(&raw_output).unwrap_or(0.0);
            CandidateResult {
                name: candidate_name.to_string(),
                mean_tflops,
                raw_output,
                exit_code: output.status.code().unwrap_or(-1),
            }
        }
        Err(e) => CandidateResult {
            name: candidate_name.to_string(),
            mean_tflops: 0.0,
            raw_output: format!("failed to spawn candidate command: {e}"),
            exit_code: 127,
        },
    }
}

pub fn pick_best(results: &[CandidateResult]) -> Option<&CandidateResult> {
    results
        .iter()
        .fold(None, |best: Option<&CandidateResult>, r| match best {
            Some(b) if b.mean_tflops >= r.mean_tflops => Some(b),
            _ => Some(r),
        })
}

pub fn pick_second_best(results: &[CandidateResult]) -> Option<&CandidateResult> {
    if results.len() < 2 {
        return None;
    }
    let best_idx = results
        .iter()
        .enumerate()
        .fold(0, |best_i, (i, r)| {
            if r.mean_tflops > results[best_i].mean_tflops {
                i
            } else {
                best_i
            }
        });
    let mut second_idx = if best_idx == 0 { 1 } else { 0 };
    for (i, r) in results.iter().enumerate() {
        if i == best_idx {
            continue;
        }
        if r.mean_tflops > results[second_idx].mean_tflops {
            second_idx = i;
        }
    }
    Some(&results[second_idx])
}

fn run_all_candidates(
    args: RunArgs,
    exe_dir: &str,
    candidates: &[Candidate],
    caps: &DeviceCapabilities,
    fp16_blocked: bool,
) -> Vec<CandidateResult> {
    candidates
        .iter()
        .map(|candidate| {
            if fp16_blocked && candidate_is_fp16(candidate) {
                return CandidateResult {
                    name: candidate.name.clone(),
                    mean_tflops: 0.0,
                    raw_output: "SKIPPED (fp16 blacklisted)".into(),
                    exit_code: 0,
                };
            }
            if !candidate_valid_for_device(candidate, caps) {
                return CandidateResult {
                    name: candidate.name.clone(),
                    mean_tflops: 0.0,
                    raw_output: "SKIPPED (device capability mismatch)".into(),
                    exit_code: 0,
                };
            }
            let command = format!(
                "{exe_dir}/{} --m {} --n {} --k {} --iters {} --batch {}",
                candidate.exe, args.m, args.n, args.k, args.iters, args.batch
            );
            run_candidate_command(&candidate.name, &command)
        })
        .collect()
}

/// Resolve the best GEMM variant for `args` on the probed device, consulting
/// (and updating) the persistent cache.
pub fn resolve_winner(args: RunArgs, exe_dir: &str, candidates: &[Candidate], caps: &DeviceCapabilities) -> ResolveResult {
    let mut out = ResolveResult::default();

    let device_key = caps.device_key();
    let bucket = make_bucket(args.m, args.n, args.k);
    out.device_key = device_key.clone();
    out.bucket = bucket.clone();

    let blacklist = Fp16Blacklist::new();
    let fp16_blocked = blacklist.contains(&device_key) && !env_flag_true("VK_FP16_ALLOW_UNSAFE");

    let mut cache = AutotuneCache::new();
    cache.load();
    out.cache_path = cache.path().display().to_string();

    let no_write = env_flag_true("VK_AUTOTUNE_NO_WRITE");

    if fp16_blocked && !no_write {
        cache.upsert(&device_key, "meta:fp16_blacklist", "1");
        cache.upsert(&device_key, "meta:fp16_fallback_reason", &blacklist.reason(&device_key));
        cache.save();
    }

    if let Ok(forced) = std::env::var("VK_AUTOTUNE_FORCE") {
        if !forced.is_empty() && candidates.iter().any(|c| c.name == forced) {
            if fp16_blocked && is_fp16_name(&forced) {
                debug!(forced = %forced, "ignoring forced fp16 winner on blacklisted device");
            } else {
                out.winner = forced.clone();
                out.force_winner = true;
                if !no_write && env_flag_true("VK_AUTOTUNE_PERSIST_FORCE") {
                    cache.upsert(&device_key, &bucket, &forced);
                    cache.save();
                }
                return out;
            }
        } else if !forced.is_empty() {
            warn!(forced = %forced, "forced autotune winner is not a known candidate, ignoring");
        }
    }

    if env_flag_true("VK_AUTOTUNE_CLEAR") {
        cache.clear();
    }

    let retune = env_flag_true("VK_AUTOTUNE_RETUNE");
    if !retune {
        if let Some(winner) = cache.find_winner(&device_key, &bucket) {
            if !(fp16_blocked && is_fp16_name(winner)) {
                out.winner = winner.to_string();
                out.used_cache = true;
                return out;
            }
        }
    }

    out.retuned = true;
    let results = run_all_candidates(args, exe_dir, candidates, caps, fp16_blocked);

    let Some(best) = pick_best(&results) else {
        out.results = results;
        return out;
    };
    let second = pick_second_best(&results);

    out.winner = best.name.clone();
    out.winner_tflops = best.mean_tflops;
    out.second_tflops = second.map(|s| s.mean_tflops).unwrap_or(0.0);

    if let Ok(min_tflops) = std::env::var("VK_AUTOTUNE_MIN_TFLOPS").map(|v| v.parse::<f64>()) {
        if let Ok(min_tflops) = min_tflops {
            if out.winner_tflops < min_tflops {
                out.winner.clear();
                out.results = results;
                return out;
            }
        }
    }

    let margin: f64 = std::env::var("VK_AUTOTUNE_MARGIN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1.03);
    let rerun_iters: u32 = std::env::var("VK_AUTOTUNE_RERUN_ITERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);

    if let Some(second) = second {
        if second.mean_tflops > 0.0 && best.mean_tflops > 0.0 {
            let ratio = best.mean_tflops / second.mean_tflops;
            if ratio < margin {
                let best_name = best.name.clone();
                let second_name = second.name.clone();
                let top2: Vec<Candidate> = candidates
                    .iter()
                    .filter(|c| c.name == best_name)
                    .chain(candidates.iter().filter(|c| c.name == second_name))
                    .cloned()
                    .collect();
                let mut args2 = args;
                args2.iters = args.iters.max(rerun_iters);
                let results2 = run_all_candidates(args2, exe_dir, &top2, caps, fp16_blocked);
                if let Some(best2) = pick_best(&results2) {
                    out.winner = best2.name.clone();
                    out.winner_tflops = best2.mean_tflops;
                    out.second_tflops = pick_second_best(&results2).map(|s| s.mean_tflops).unwrap_or(0.0);
                }
            }
        }
    }

    if !no_write && !out.winner.is_empty() {
        cache.upsert(&device_key, &bucket, &out.winner);
        cache.save();
    }

    out.results = results;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mean_tflops_extracts_float() {
        assert_eq!(parse_mean_tflops("warmup...\nmean_TFLOPs=3.14\ndone"), Some(3.14));
        assert_eq!(parse_mean_tflops("no marker here"), None);
    }

    #[test]
    fn pick_best_prefers_highest_tflops() {
        let results = vec![
            CandidateResult {
                name: "a".into(),
                mean_tflops: 1.0,
                ..Default::default()
            },
            CandidateResult {
                name: "b".into(),
                mean_tflops: 5.0,
                ..Default::default()
            },
        ];
        assert_eq!(pick_best(&results).unwrap().name, "b");
    }

    #[test]
    fn pick_second_best_excludes_the_winner() {
        let results = vec![
            CandidateResult {
                name: "a".into(),
                mean_tflops: 1.0,
                ..Default::default()
            },
            CandidateResult {
                name: "b".into(),
                mean_tflops: 5.0,
                ..Default::default()
            },
            CandidateResult {
                name: "c".into(),
                mean_tflops: 3.0,
                ..Default::default()
            },
        ];
        assert_eq!(pick_second_best(&results).unwrap().name, "c");
    }

    #[test]
    fn pick_second_best_needs_two_entries() {
        let results = vec![CandidateResult {
            name: "a".into(),
            mean_tflops: 1.0,
            ..Default::default()
        }];
        assert!(pick_second_best(&results).is_none());
    }

    #[test]
    fn subgroup32_candidate_invalid_when_device_min_exceeds_32() {
        let candidate = Candidate {
            name: "subgroup".into(),
            exe: "vk_gemm_f16acc32_subgroup_ts_bench".into(),
            requires_subgroup32: true,
        };
        let caps = DeviceCapabilities {
            vendor_id: 0x1002,
            device_id: 0x1,
            device_name: "test".into(),
            driver_name: "radv".into(),
            subgroup_size_reported: 64,
            subgroup_size_min: 64,
            subgroup_size_max: 64,
            subgroup_size_control: true,
            fp16_storage: true,
            fp16_arithmetic: true,
            robust_buffer_access: true,
        };
        assert!(!candidate_valid_for_device(&candidate, &caps));
    }
}
