//! CLI frontend exercising the core compute runtime end to end (`spec.md`
//! §6.3). The tokenizer is out of scope (`spec.md` §1 treats it as a
//! black-box `encode`/`decode` service); this binary stands in a
//! deterministic word-hash tokenizer so the pipeline is runnable without a
//! real one wired in.

use std::process::ExitCode;

use exsa_core::generator::{Generator, SamplingParams};
use exsa_core::inference::BlockScheduler;
use exsa_core::rt::Backend;
use exsa_core::rt::stream::Stream;
use exsa_core::weights::create_weight_loader;
use exsa_core::RuntimeConfig;

struct Args {
    model: Option<String>,
    prompt: String,
    batch_size: usize,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    top_k: Option<usize>,
    greedy: bool,
    config_path: Option<String>,
    safe_mode: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        model: None,
        prompt: String::new(),
        batch_size: 1,
        max_tokens: None,
        temperature: None,
        top_k: None,
        greedy: false,
        config_path: None,
        safe_mode: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--model" => args.model = iter.next(),
            "--prompt" => args.prompt = iter.next().unwrap_or_default(),
            "--batch-size" => args.batch_size = iter.next().and_then(|v| v.parse().ok()).unwrap_or(1),
            "--max-tokens" => args.max_tokens = iter.next().and_then(|v| v.parse().ok()),
            "--temperature" => args.temperature = iter.next().and_then(|v| v.parse().ok()),
            "--top-k" => args.top_k = iter.next().and_then(|v| v.parse().ok()),
            "--greedy" => args.greedy = true,
            "--config" => args.config_path = iter.next(),
            "--safe-mode" => args.safe_mode = true,
            other => {
                eprintln!("ignoring unrecognized flag: {other}");
            }
        }
    }
    args
}

/// Deterministic stand-in for the real BPE tokenizer: one token id per
/// whitespace-separated word, hashed into `[0, vocab_size)`.
fn encode(text: &str, vocab_size: u32) -> Vec<u32> {
    text.split_whitespace()
        .map(|word| {
            let mut hash: u32 = 2166136261;
            for b in word.bytes() {
                hash ^= b as u32;
                hash = hash.wrapping_mul(16777619);
            }
            hash % vocab_size.max(1)
        })
        .collect()
}

fn run() -> Result<(), String> {
    let args = parse_args();

    let config = RuntimeConfig::load(args.config_path.as_deref());
    if let Err(errors) = config.validate() {
        return Err(format!("invalid runtime config: {}", errors.join("; ")));
    }

    let level = config.logging.level.clone();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let Some(model_path) = args.model else {
        return Err("--model PATH is required".to_string());
    };

    if args.safe_mode {
        std::env::set_var("EXSA_FORCE_SAFE_MODE", "1");
    }

    let loader = create_weight_loader(&model_path).map_err(|e| e.to_string())?;
    let model_config = loader.get_config();
    tracing::info!(model = %model_path, params = model_config.param_count(), "weight container opened");

    let prompt_tokens = encode(&args.prompt, model_config.vocab_size);
    let max_seq_len = model_config.max_seq_len as usize;

    let sampling = SamplingParams {
        temperature: args.temperature.unwrap_or(config.sampling.temperature),
        top_k: args.top_k.unwrap_or(config.sampling.top_k),
        top_p: config.sampling.top_p,
        max_tokens: args.max_tokens.unwrap_or(config.sampling.max_tokens),
        seed: config.sampling.seed,
        greedy: args.greedy || config.sampling.greedy,
        eos_token_id: model_config.eos_token_id,
    };

    unsafe {
        let backend = Backend::new().map_err(|e| e.to_string())?;
        let mut scheduler = BlockScheduler::init(&backend, model_config);
        scheduler.allocate_weights().map_err(|e| e.to_string())?;
        scheduler.load_weights(loader.as_ref()).map_err(|e| e.to_string())?;
        scheduler.allocate_activations(args.batch_size, max_seq_len).map_err(|e| e.to_string())?;

        let stream = Stream::new();
        let generator = Generator::new(&scheduler);

        let stats = generator
            .generate_tokens(
                Some(&stream),
                &prompt_tokens,
                &sampling,
                Box::new(|token_id| {
                    print!("{token_id} ");
                    use std::io::Write;
                    let _ = std::io::stdout().flush();
                    true
                }),
                None,
            )
            .map_err(|e| e.to_string())?;

        println!();
        tracing::info!(
            prompt_tokens = stats.prompt_tokens,
            generated_tokens = stats.generated_tokens,
            tokens_per_second = stats.tokens_per_second(),
            time_to_first_token_ms = stats.time_to_first_token.as_secs_f64() * 1000.0,
            "generation complete"
        );
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}
