use std::{
    fmt,
    time::{Duration, Instant},
};

use tracing::debug;

/// Value recorded for a timing field.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchValue {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
    Text(String),
}

macro_rules! bench_value_from {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(impl From<$ty> for BenchValue {
            fn from($v: $ty) -> Self {
                $body
            }
        })*
    };
}

bench_value_from! {
    usize => |v| BenchValue::U64(v as u64),
    u64 => |v| BenchValue::U64(v),
    u32 => |v| BenchValue::U64(u64::from(v)),
    i64 => |v| BenchValue::I64(v),
    f64 => |v| BenchValue::F64(v),
    bool => |v| BenchValue::Bool(v),
    &str => |v| BenchValue::Text(v.to_owned()),
    String => |v| BenchValue::Text(v),
}

impl fmt::Display for BenchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchValue::U64(v) => write!(f, "{v}"),
            BenchValue::I64(v) => write!(f, "{v}"),
            BenchValue::F64(v) => write!(f, "{v:.3}"),
            BenchValue::Bool(v) => write!(f, "{v}"),
            BenchValue::Text(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchField {
    pub key: &'static str,
    pub value: BenchValue,
}

/// One completed stage measurement.
#[derive(Debug, Clone)]
pub struct BenchEvent {
    pub stage: &'static str,
    pub duration: Duration,
    pub fields: Vec<BenchField>,
}

impl BenchEvent {
    pub fn add_field<K, V>(&mut self, key: K, value: V)
    where
        K: Into<&'static str>,
        V: Into<BenchValue>,
    {
        self.fields.push(BenchField {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn field(&self, key: &str) -> Option<&BenchValue> {
        self.fields
            .iter()
            .find(|field| field.key == key)
            .map(|field| &field.value)
    }

    fn emit(&self) {
        debug!(
            target: "docvl::timing",
            stage = self.stage,
            elapsed_ms = self.duration.as_secs_f64() * 1e3,
            fields = %FieldList(&self.fields),
        );
    }
}

struct FieldList<'a>(&'a [BenchField]);

impl fmt::Display for FieldList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, field) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", field.key, field.value)?;
        }
        Ok(())
    }
}

/// Measures a named stage and reports it as a `docvl::timing` debug event.
///
/// A timer dropped without `finish` still reports, with no extra fields.
pub struct Timer {
    stage: &'static str,
    start: Instant,
    emitted: bool,
}

impl Timer {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
            emitted: false,
        }
    }

    pub fn finish<F>(mut self, update: F) -> BenchEvent
    where
        F: FnOnce(&mut BenchEvent),
    {
        self.emitted = true;
        let mut event = self.event();
        update(&mut event);
        event.emit();
        event
    }

    fn event(&self) -> BenchEvent {
        BenchEvent {
            stage: self.stage,
            duration: self.start.elapsed(),
            fields: Vec::new(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.emitted {
            self.event().emit();
        }
    }
}
