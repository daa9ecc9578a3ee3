use std::{
    cell::Cell,
    io::{self, Write},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use docvl_config::{AppConfig, ConfigOverrides};
use docvl_core::{
    GenerationResult, ModelLoadArgs, OcrError, load_tokenizer, runtime::prepare_device_and_dtype,
};
use docvl_infer::{load_image, load_model};
use tracing::info;

use crate::{args::Args, prompt::resolve_prompt};

pub fn run(args: Args) -> Result<()> {
    let (app_config, source) = AppConfig::load_with_overrides(ConfigOverrides::from(&args))?;
    match &source {
        Some(path) => info!("Using configuration {}", path.display()),
        None => info!("No configuration file found; using defaults"),
    }

    let resources = app_config.model.resolve()?;
    let settings = &app_config.inference;
    let prompt = resolve_prompt(&args, settings.task)?;
    let vision = settings.vision_settings();
    let params = settings.generation_params();

    let (device, dtype) = prepare_device_and_dtype(settings.device, settings.precision)?;
    info!(
        "Loading model (device={:?}, dtype={:?}) from {}",
        device,
        dtype,
        resources.weights.display()
    );
    let load_start = Instant::now();
    let model = load_model(&ModelLoadArgs {
        config_path: Some(resources.config.clone()),
        weights_path: resources.weights.clone(),
        device,
        dtype,
    })?;
    info!("Model ready in {:.2?}", load_start.elapsed());

    let tokenizer = load_tokenizer(&resources.tokenizer)?;

    let images = args
        .images
        .iter()
        .map(|path| load_image(path))
        .collect::<Result<Vec<_>, OcrError>>()?;
    if images.is_empty() {
        return Err(OcrError::ImageRequired.into());
    }

    info!(
        "Recognising {} image(s) with prompt {:?} (budget {} tokens, {:?})",
        images.len(),
        prompt,
        params.max_new_tokens,
        vision.resize
    );

    let multiple = images.len() > 1;
    for (index, (path, image)) in args.images.iter().zip(&images).enumerate() {
        if multiple {
            println!("==> {} <==", path.display());
        }
        let first_delta = Cell::new(None::<Instant>);
        let mut stdout = io::stdout();
        let mut sink = |delta: &str| {
            if first_delta.get().is_none() {
                first_delta.set(Some(Instant::now()));
            }
            let _ = write!(stdout, "{delta}");
            let _ = stdout.flush();
        };
        let stream: Option<&mut dyn FnMut(&str)> = if args.quiet { None } else { Some(&mut sink) };

        let start = Instant::now();
        let result = model
            .recognize(&tokenizer, Some(image), &prompt, &vision, &params, stream)
            .map_err(|err| err.for_image(index))
            .with_context(|| format!("recognition failed for {}", path.display()))?;
        let elapsed = start.elapsed();

        if args.quiet {
            println!("{}", result.text);
        } else {
            println!();
        }
        log_throughput(&result, elapsed, first_delta.get().map(|at| at - start));
    }
    Ok(())
}

/// Prefill ends at the first streamed delta; without streaming the whole call is attributed to it.
fn log_throughput(result: &GenerationResult, total: Duration, prefill: Option<Duration>) {
    let prefill = prefill.filter(|d| *d <= total).unwrap_or(total);
    let decode = total.checked_sub(prefill).unwrap_or_default();
    let rate = |tokens: usize, secs: f64| if secs > 0.0 { tokens as f64 / secs } else { 0.0 };
    let prefill_secs = prefill.as_secs_f64();
    let decode_secs = decode.as_secs_f64();
    let prompt_tokens = result.prompt_tokens;
    let generated = result.generated_tokens.len();
    info!(
        "Throughput: prefill={prompt_tokens} tok in {prefill_secs:.2}s ({:.2} tok/s); generation={generated} tok in {decode_secs:.2}s ({:.2} tok/s)",
        rate(prompt_tokens, prefill_secs),
        rate(generated, decode_secs)
    );
}
