use std::fmt;

/// One kind of external generation function the gateway can throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Script,
    Image,
    Speech,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Script, Capability::Image, Capability::Speech];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Script => "script",
            Capability::Image => "image",
            Capability::Speech => "speech",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A single request for one capability.
///
/// `asset_name` is the stem the producer uses for any file it writes; the
/// producer decides directory and extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProduceRequest {
    Script {
        prompt: String,
    },
    Image {
        prompt: String,
        asset_name: String,
    },
    Speech {
        voice_id: String,
        text: String,
        asset_name: String,
    },
}

impl ProduceRequest {
    pub fn script(prompt: impl Into<String>) -> Self {
        Self::Script {
            prompt: prompt.into(),
        }
    }

    pub fn image(prompt: impl Into<String>, asset_name: impl Into<String>) -> Self {
        Self::Image {
            prompt: prompt.into(),
            asset_name: asset_name.into(),
        }
    }

    pub fn speech(
        voice_id: impl Into<String>,
        text: impl Into<String>,
        asset_name: impl Into<String>,
    ) -> Self {
        Self::Speech {
            voice_id: voice_id.into(),
            text: text.into(),
            asset_name: asset_name.into(),
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            Self::Script { .. } => Capability::Script,
            Self::Image { .. } => Capability::Image,
            Self::Speech { .. } => Capability::Speech,
        }
    }
}
