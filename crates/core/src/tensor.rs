use anyhow::{Result, bail, ensure};
use candle_core::{DType, Tensor};

/// Gather token embeddings for a batch of input ids.
///
/// `weight` must be `[vocab, hidden]` and `ids` must be rank-2 `[batch, seq]`. The returned tensor
/// has shape `[batch, seq, hidden]`.
pub fn gather_token_embeddings(weight: &Tensor, ids: &Tensor) -> Result<Tensor> {
    ensure!(
        ids.rank() == 2,
        "input ids must have shape [batch, seq], got rank {}",
        ids.rank()
    );
    let (vocab, hidden) = weight.shape().dims2()?;
    let (batch, seq_len) = ids.shape().dims2()?;
    let ids = if ids.dtype() == DType::U32 {
        ids.clone()
    } else {
        ids.to_dtype(DType::U32)?
    };
    let flat = ids.reshape((batch * seq_len,))?.contiguous()?;
    if let Some(&max_id) = flat.to_vec1::<u32>()?.iter().max() {
        ensure!(
            (max_id as usize) < vocab,
            "token id {max_id} is outside the vocabulary of {vocab}"
        );
    }
    let gathered = weight.index_select(&flat, 0)?;
    Ok(gathered.reshape((batch, seq_len, hidden))?)
}

/// Splice visual embeddings into the placeholder run of a token sequence.
///
/// `text_embeds` is `[1, seq, hidden]` from the embedding table and `visual` is
/// `[1, rows, hidden]` (or `[rows, hidden]`). Placeholder positions must form one contiguous run.
/// When `rows` differs from the run length, visual rows are zero-padded or truncated to fit. A
/// sequence without placeholders is returned unchanged.
pub fn merge_image_embeddings(
    token_ids: &[i64],
    text_embeds: &Tensor,
    visual: &Tensor,
    image_token_id: i64,
) -> Result<Tensor> {
    let (batch, seq_len, hidden) = text_embeds.shape().dims3()?;
    ensure!(batch == 1, "image merging expects batch size 1, got {batch}");
    ensure!(
        token_ids.len() == seq_len,
        "token count {} does not match embedding length {seq_len}",
        token_ids.len()
    );

    let Some(start) = token_ids.iter().position(|&id| id == image_token_id) else {
        return Ok(text_embeds.clone());
    };
    let run = token_ids.iter().filter(|&&id| id == image_token_id).count();
    ensure!(
        token_ids[start..start + run]
            .iter()
            .all(|&id| id == image_token_id),
        "image placeholder tokens are not contiguous (first at {start}, {run} in total)"
    );

    let visual = match visual.rank() {
        2 => visual.clone(),
        3 => visual.squeeze(0)?,
        rank => bail!("visual embeddings must be rank 2 or 3, got rank {rank}"),
    };
    let (rows, visual_hidden) = visual.shape().dims2()?;
    ensure!(
        visual_hidden == hidden,
        "visual hidden size {visual_hidden} does not match text hidden size {hidden}"
    );
    let visual = visual.to_dtype(text_embeds.dtype())?;
    let aligned = if rows >= run {
        visual.narrow(0, 0, run)?
    } else {
        let pad = Tensor::zeros((run - rows, hidden), visual.dtype(), visual.device())?;
        Tensor::cat(&[&visual, &pad], 0)?
    };

    let mut parts = Vec::with_capacity(3);
    if start > 0 {
        parts.push(Tensor::zeros(
            (start, hidden),
            aligned.dtype(),
            aligned.device(),
        )?);
    }
    parts.push(aligned);
    let tail = seq_len - start - run;
    if tail > 0 {
        parts.push(Tensor::zeros(
            (tail, hidden),
            text_embeds.dtype(),
            text_embeds.device(),
        )?);
    }
    let scattered = Tensor::cat(&parts, 0)?.unsqueeze(0)?;

    let mask: Vec<u8> = token_ids
        .iter()
        .map(|&id| u8::from(id == image_token_id))
        .collect();
    let mask = Tensor::from_vec(mask, (1, seq_len, 1), text_embeds.device())?
        .broadcast_as((1, seq_len, hidden))?;
    Ok(mask.where_cond(&scattered, text_embeds)?)
}
