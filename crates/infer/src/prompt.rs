use docvl_core::SpecialTokens;

use crate::config::DocVlConfig;

/// Special ids framing the image placeholder run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLayout {
    pub bos: Option<i64>,
    pub vision_start: i64,
    pub image_token: i64,
    pub vision_end: i64,
}

impl PromptLayout {
    pub fn new(cfg: &DocVlConfig, special: &SpecialTokens) -> Self {
        Self {
            bos: special.bos,
            vision_start: cfg.vision_start_token_id,
            image_token: cfg.image_token_index,
            vision_end: cfg.vision_end_token_id,
        }
    }
}

/// `[bos?] <vision_start> <image> x num_image_tokens <vision_end> prompt...`
pub fn build_prompt_tokens(
    layout: &PromptLayout,
    num_image_tokens: usize,
    prompt_ids: &[i64],
) -> Vec<i64> {
    let mut tokens = Vec::with_capacity(num_image_tokens + prompt_ids.len() + 3);
    tokens.extend(layout.bos);
    tokens.push(layout.vision_start);
    tokens.extend(std::iter::repeat_n(layout.image_token, num_image_tokens));
    tokens.push(layout.vision_end);
    tokens.extend_from_slice(prompt_ids);
    tokens
}
