//! Declarative stage descriptors and the format contracts between them.

use std::fmt;

use crate::capture::{ParamValue, PixelFormat};

/// Role of a stage in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Source,
    /// Leaky single-buffer queue decoupling the source thread
    Queue,
    Decode,
    FormatFilter,
    RateFilter,
    ScaleFilter,
    ConvertFilter,
    Sink,
}

/// Where raw video lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    System,
    Gpu,
}

/// What a stage emits on its source pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaContract {
    /// Unknown until negotiated (camera sources)
    Any,
    Encoded,
    Raw {
        memory: Memory,
        format: Option<PixelFormat>,
    },
}

impl MediaContract {
    pub const RAW: MediaContract = MediaContract::Raw {
        memory: Memory::System,
        format: None,
    };
}

/// What a stage accepts on its sink pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepts {
    /// Source stages have no input
    Nothing,
    Anything,
    /// Compressed input, or input that may turn out compressed
    Encoded,
    Raw(Memory),
    /// Packed raw in system memory, exactly this layout
    Packed(PixelFormat),
}

impl Accepts {
    pub fn admits(self, upstream: MediaContract) -> bool {
        match (self, upstream) {
            (Accepts::Nothing, _) => false,
            (Accepts::Anything, _) => true,
            (Accepts::Encoded, MediaContract::Encoded | MediaContract::Any) => true,
            (Accepts::Raw(want), MediaContract::Raw { memory, .. }) => want == memory,
            (
                Accepts::Packed(want),
                MediaContract::Raw {
                    memory: Memory::System,
                    format: Some(have),
                },
            ) => want == have,
            _ => false,
        }
    }
}

/// One element of the chain, before instantiation.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub kind: StageKind,
    pub factory: String,
    /// Element properties, applied in order
    pub params: Vec<(String, ParamValue)>,
    /// Caps for `capsfilter` stages
    pub caps: Option<String>,
    pub input: Accepts,
    pub output: MediaContract,
}

impl StageDescriptor {
    pub fn new(
        kind: StageKind,
        factory: impl Into<String>,
        input: Accepts,
        output: MediaContract,
    ) -> Self {
        Self {
            kind,
            factory: factory.into(),
            params: Vec::new(),
            caps: None,
            input,
            output,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.push((name.into(), value));
        self
    }

    /// A `capsfilter` stage; the contract passes through with `output` applied.
    pub fn caps_filter(caps: impl Into<String>, input: Accepts, output: MediaContract) -> Self {
        let mut stage = Self::new(StageKind::FormatFilter, "capsfilter", input, output);
        stage.caps = Some(caps.into());
        stage
    }
}

impl fmt::Display for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(caps) = &self.caps {
            return write!(f, "{caps}");
        }
        write!(f, "{}", self.factory)?;
        for (name, value) in &self.params {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_stages_reject_unknown_input() {
        assert!(!Accepts::Raw(Memory::System).admits(MediaContract::Any));
        assert!(!Accepts::Raw(Memory::System).admits(MediaContract::Encoded));
        assert!(Accepts::Raw(Memory::System).admits(MediaContract::RAW));
    }

    #[test]
    fn memory_must_match() {
        let gpu = MediaContract::Raw {
            memory: Memory::Gpu,
            format: None,
        };
        assert!(!Accepts::Raw(Memory::System).admits(gpu));
        assert!(Accepts::Raw(Memory::Gpu).admits(gpu));
    }

    #[test]
    fn packed_requires_declared_format() {
        let bgr = MediaContract::Raw {
            memory: Memory::System,
            format: Some(PixelFormat::Bgr24),
        };
        assert!(Accepts::Packed(PixelFormat::Bgr24).admits(bgr));
        assert!(!Accepts::Packed(PixelFormat::Rgb24).admits(bgr));
        assert!(!Accepts::Packed(PixelFormat::Bgr24).admits(MediaContract::RAW));
    }

    #[test]
    fn decoders_take_unknown_sources() {
        assert!(Accepts::Encoded.admits(MediaContract::Any));
        assert!(!Accepts::Nothing.admits(MediaContract::Any));
    }

    #[test]
    fn display_renders_like_a_launch_fragment() {
        let stage = StageDescriptor::new(
            StageKind::RateFilter,
            "videorate",
            Accepts::Raw(Memory::System),
            MediaContract::RAW,
        )
        .param("drop-only", ParamValue::Bool(true))
        .param("max-rate", ParamValue::Int(30));
        assert_eq!(stage.to_string(), "videorate drop-only=true max-rate=30");
    }
}
