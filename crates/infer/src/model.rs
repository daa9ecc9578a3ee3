use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::DynamicImage;
use tracing::{debug, info};

use docvl_core::{
    GenerationParams, GenerationResult, ModelLoadArgs, OcrEngine, OcrError, ResizeMode,
    SpecialTokens, StreamCallback, TextTokenizer, VisionSettings, benchmark::Timer,
    generate_tokens, tensor::merge_image_embeddings,
};

use crate::{
    config::{DocVlConfig, LoadedConfig, PreprocessorConfig, load_config},
    prompt::{PromptLayout, build_prompt_tokens},
    transformer::LanguageDecoder,
    vision::{ImagePreprocessor, Projector, VisionEncoder},
    weights::load_sanitized_weights,
};

/// Document VLM: vision encoder, projector and language decoder over one weight set.
pub struct DocVlModel {
    config: Arc<DocVlConfig>,
    preprocessor: PreprocessorConfig,
    config_path: Option<PathBuf>,
    device: Device,
    dtype: DType,
    vision: VisionEncoder,
    projector: Projector,
    decoder: LanguageDecoder,
}

/// Projected image ready to be spliced into the prompt.
struct EncodedImage {
    embeddings: Tensor,
    num_image_tokens: usize,
}

impl DocVlModel {
    pub fn load(args: &ModelLoadArgs) -> Result<Self, OcrError> {
        let config_source = match &args.config_path {
            Some(path) => path.clone(),
            None if args.weights_path.is_file() => args
                .weights_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            None => args.weights_path.clone(),
        };
        let LoadedConfig {
            value,
            preprocessor,
            path,
        } = load_config(&config_source).map_err(OcrError::configuration)?;
        let weights = load_sanitized_weights(&args.weights_path).map_err(OcrError::model_load)?;
        let mut model = Self::from_weights(value, preprocessor, weights, &args.device, args.dtype)?;
        model.config_path = Some(path);
        Ok(model)
    }

    /// Build from an already sanitized `name -> tensor` map.
    pub fn from_weights(
        config: DocVlConfig,
        preprocessor: PreprocessorConfig,
        weights: HashMap<String, Tensor>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, OcrError> {
        config.validate().map_err(OcrError::configuration)?;
        let timer = Timer::new("model.load");
        let tensor_count = weights.len();
        let vb = VarBuilder::from_tensors(weights, dtype, device);
        let vision = VisionEncoder::load(&vb.pp("vision_tower"), &config.vision_config, dtype)
            .context("failed to load vision encoder")
            .map_err(OcrError::model_load)?;
        let projector = Projector::load(
            &vb.pp("multi_modal_projector"),
            config.vision_config.hidden_size,
            config.text_config.hidden_size,
            &config.projector_hidden_act,
        )
        .context("failed to load projector")
        .map_err(OcrError::model_load)?;
        let decoder = LanguageDecoder::load(
            Arc::new(config.text_config.clone()),
            &vb,
            config.tie_word_embeddings,
        )
        .context("failed to load language decoder")
        .map_err(OcrError::model_load)?;
        timer.finish(|event| event.add_field("tensors", tensor_count));
        info!(
            vision_layers = config.vision_config.num_hidden_layers,
            text_layers = config.text_config.num_hidden_layers,
            vocab = config.text_config.vocab_size,
            tied = config.tie_word_embeddings,
            ?dtype,
            "document model ready"
        );
        Ok(Self {
            config: Arc::new(config),
            preprocessor,
            config_path: None,
            device: device.clone(),
            dtype,
            vision,
            projector,
            decoder,
        })
    }

    pub fn config(&self) -> &DocVlConfig {
        self.config.as_ref()
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Dynamic resizing within the pixel budget published by the checkpoint.
    pub fn default_vision_settings(&self) -> VisionSettings {
        VisionSettings {
            resize: ResizeMode::Dynamic {
                min_pixels: self.preprocessor.min_pixels,
                max_pixels: self.preprocessor.max_pixels,
            },
        }
    }

    pub fn preprocessor(&self, vision: &VisionSettings) -> Result<ImagePreprocessor> {
        ImagePreprocessor::from_config(
            self.config.vision_config.patch_size,
            vision.resize,
            &self.preprocessor,
        )
    }

    fn encode_image(
        &self,
        image: &DynamicImage,
        vision: &VisionSettings,
    ) -> Result<EncodedImage, OcrError> {
        let processed = self
            .preprocessor(vision)
            .map_err(OcrError::configuration)?
            .process(image, &self.device, self.dtype)
            .context("image preprocessing failed")
            .map_err(OcrError::generation)?;
        let timer = Timer::new("vision.encode");
        let features = self
            .vision
            .encode(&processed.pixel_values)
            .context("vision encoder failed")?;
        let embeddings = self
            .projector
            .project(&features, self.dtype)
            .context("projector failed")?;
        timer.finish(|event| {
            event.add_field("width", processed.width);
            event.add_field("height", processed.height);
            event.add_field("patches", processed.num_image_tokens);
        });
        Ok(EncodedImage {
            embeddings,
            num_image_tokens: processed.num_image_tokens,
        })
    }

    fn stop_tokens(&self, special: &SpecialTokens) -> Vec<i64> {
        let mut stops = vec![special.eos];
        for &id in &self.config.stop_token_ids {
            if !stops.contains(&id) {
                stops.push(id);
            }
        }
        stops
    }

    /// Recognise one page. Each call owns a fresh KV cache.
    pub fn generate(
        &self,
        tokenizer: &dyn TextTokenizer,
        image: Option<&DynamicImage>,
        prompt: &str,
        vision: &VisionSettings,
        params: &GenerationParams,
        stream: Option<StreamCallback<'_>>,
    ) -> Result<GenerationResult, OcrError> {
        let image = image.ok_or(OcrError::ImageRequired)?;
        let special = SpecialTokens::resolve(
            tokenizer,
            self.config.bos_token_id,
            self.config.eos_token_id,
        );
        let encoded = self.encode_image(image, vision)?;

        let prompt_ids = tokenizer
            .encode(prompt)
            .context("failed to tokenize prompt")?;
        let layout = PromptLayout::new(&self.config, &special);
        let tokens = build_prompt_tokens(&layout, encoded.num_image_tokens, &prompt_ids);
        debug!(
            prompt_tokens = tokens.len(),
            image_tokens = encoded.num_image_tokens,
            "prompt assembled"
        );

        let text_embeds = self.decoder.embed(&tokens)?;
        let inputs_embeds = merge_image_embeddings(
            &tokens,
            &text_embeds,
            &encoded.embeddings,
            layout.image_token,
        )
        .context("failed to merge image embeddings")?;

        let decoded = generate_tokens(
            &self.decoder,
            tokenizer,
            &inputs_embeds,
            &self.stop_tokens(&special),
            params,
            stream,
        )?;
        Ok(GenerationResult {
            text: decoded.text,
            prompt_tokens: tokens.len(),
            generated_tokens: decoded.tokens,
        })
    }
}

impl OcrEngine for DocVlModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn recognize(
        &self,
        tokenizer: &dyn TextTokenizer,
        image: Option<&DynamicImage>,
        prompt: &str,
        vision: &VisionSettings,
        params: &GenerationParams,
        stream: Option<StreamCallback<'_>>,
    ) -> Result<GenerationResult, OcrError> {
        self.generate(tokenizer, image, prompt, vision, params, stream)
    }
}

pub fn load_model(args: &ModelLoadArgs) -> Result<Box<dyn OcrEngine>, OcrError> {
    Ok(Box::new(DocVlModel::load(args)?))
}

pub fn load_image(path: &Path) -> Result<DynamicImage, OcrError> {
    image::open(path).map_err(|err| OcrError::image_load(path, err))
}
