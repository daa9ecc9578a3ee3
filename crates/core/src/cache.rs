use anyhow::{Context, Result, ensure};
use candle_core::{Tensor, shape::D};

/// Key/value tensors produced by one attention call, before grouped-query expansion.
///
/// Keys are stored transposed as `[batch, kv_heads, head_dim, seq]` so attention can matmul them
/// directly; values keep `[batch, kv_heads, seq, head_dim]`.
#[derive(Debug, Clone)]
pub struct KvCacheChunk {
    pub key_t: Tensor,
    pub value: Tensor,
}

impl KvCacheChunk {
    pub fn new(key_t: Tensor, value: Tensor) -> Result<Self> {
        ensure!(
            key_t.rank() == 4,
            "expected key chunk tensor with rank 4 [batch, heads, dim, seq], got rank {}",
            key_t.rank()
        );
        ensure!(
            value.rank() == 4,
            "expected value chunk tensor with rank 4 [batch, heads, seq, dim], got rank {}",
            value.rank()
        );
        let (key_batch, key_heads, _key_dim, key_seq) =
            key_t.shape().dims4().context("key chunk must be 4D")?;
        let (val_batch, val_heads, val_seq, _) =
            value.shape().dims4().context("value chunk must be 4D")?;
        ensure!(
            key_batch == val_batch,
            "chunk batch mismatch between key ({key_batch}) and value ({val_batch})"
        );
        ensure!(
            key_heads == val_heads,
            "chunk heads mismatch between key ({key_heads}) and value ({val_heads})"
        );
        ensure!(
            key_seq == val_seq,
            "chunk sequence mismatch between key ({key_seq}) and value ({val_seq})"
        );
        Ok(Self { key_t, value })
    }

    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.key_t.dim(D::Minus1)?)
    }
}

/// Cached keys/values for a single decoder layer. Grows by concatenation along the sequence axis.
#[derive(Debug, Clone)]
pub struct KvCacheEntry {
    key_t: Tensor,
    value: Tensor,
}

impl KvCacheEntry {
    pub fn from_chunk(chunk: KvCacheChunk) -> Self {
        Self {
            key_t: chunk.key_t,
            value: chunk.value,
        }
    }

    fn validate_chunk(&self, chunk: &KvCacheChunk) -> Result<()> {
        let (batch, heads, key_dim, _) = self.key_t.shape().dims4()?;
        let (chunk_batch, chunk_heads, chunk_key_dim, _) = chunk
            .key_t
            .shape()
            .dims4()
            .context("key chunk must be 4D")?;
        ensure!(
            chunk_batch == batch && chunk_heads == heads && chunk_key_dim == key_dim,
            "chunk key layout [{chunk_batch}, {chunk_heads}, {chunk_key_dim}, _] does not match \
             cache layout [{batch}, {heads}, {key_dim}, _]"
        );
        ensure!(
            chunk.key_t.dtype() == self.key_t.dtype(),
            "chunk dtype {:?} does not match cache dtype {:?}",
            chunk.key_t.dtype(),
            self.key_t.dtype()
        );
        ensure!(
            chunk.key_t.device().location() == self.key_t.device().location(),
            "chunk device {:?} does not match cache device {:?}",
            chunk.key_t.device(),
            self.key_t.device()
        );
        let (_, _, _, value_dim) = self.value.shape().dims4()?;
        let (_, _, _, chunk_value_dim) = chunk.value.shape().dims4()?;
        ensure!(
            chunk_value_dim == value_dim,
            "chunk value dim {chunk_value_dim} does not match cache value dim {value_dim}"
        );
        Ok(())
    }

    pub fn append(&mut self, chunk: &KvCacheChunk) -> Result<()> {
        self.validate_chunk(chunk)?;
        if chunk.seq_len()? == 0 {
            return Ok(());
        }
        self.key_t = Tensor::cat(&[&self.key_t, &chunk.key_t], D::Minus1)?;
        self.value = Tensor::cat(&[&self.value, &chunk.value], D::Minus2)?;
        Ok(())
    }

    pub fn key_view(&self) -> &Tensor {
        &self.key_t
    }

    pub fn value_view(&self) -> &Tensor {
        &self.value
    }

    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.key_t.dim(D::Minus1)?)
    }
}

/// Per-generation decoder cache. One slot per layer; the offset is the number of cached
/// positions, shared by every layer once a forward pass completes.
#[derive(Debug, Clone)]
pub struct DynamicCache {
    layers: Vec<Option<KvCacheEntry>>,
    offset: usize,
}

impl DynamicCache {
    pub fn with_num_layers(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
            offset: 0,
        }
    }

    /// Number of positions already cached; also the RoPE base for the next call.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub fn get(&self, layer_idx: usize) -> Option<&KvCacheEntry> {
        self.layers.get(layer_idx).and_then(|entry| entry.as_ref())
    }

    /// Append the chunk for `layer_idx`, returning the full cached keys and values for that layer.
    ///
    /// The offset only advances when the final layer has absorbed the chunk, so every layer in a
    /// forward pass sees the same base position.
    pub fn append(&mut self, layer_idx: usize, chunk: KvCacheChunk) -> Result<(Tensor, Tensor)> {
        ensure!(
            layer_idx < self.layers.len(),
            "layer {layer_idx} is outside a cache of {} layers",
            self.layers.len()
        );
        let chunk_len = chunk.seq_len()?;
        let offset = self.offset;
        match self.layers[layer_idx].as_mut() {
            Some(existing) => {
                let cached = existing.seq_len()?;
                ensure!(
                    cached == offset,
                    "layer {layer_idx} caches {cached} positions but offset is {offset}"
                );
                existing.append(&chunk)?;
            }
            None => {
                ensure!(
                    offset == 0,
                    "layer {layer_idx} has no cache entry at offset {offset}"
                );
                self.layers[layer_idx] = Some(KvCacheEntry::from_chunk(chunk));
            }
        }
        let entry = self.layers[layer_idx]
            .as_ref()
            .context("cache entry missing after append")?;
        let outputs = (entry.key_view().clone(), entry.value_view().clone());
        if layer_idx + 1 == self.layers.len() {
            self.offset += chunk_len;
        }
        Ok(outputs)
    }

    pub fn clear(&mut self) {
        for entry in &mut self.layers {
            *entry = None;
        }
        self.offset = 0;
    }
}
