use serde::Serialize;
use snafu::{OptionExt, ResultExt, ensure};
use storyreel_producer::ProducerResult;
use storyreel_storage::ElementKind;

use crate::context::GenerationContext;
use crate::error::{
    MissingVersionSnafu, NotReadySnafu, ProducerSnafu, SequenceResult, SerializeSnafu,
    UnusableSentenceSnafu,
};
use crate::versions::VersionedElement;

/// One position of a sequence with independently versioned text, image and audio.
///
/// `label` names produced assets and never changes; `position` follows the segment's
/// index in its sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    label: String,
    #[serde(rename = "index")]
    position: usize,
    text: VersionedElement,
    image: VersionedElement,
    audio: VersionedElement,
}

/// Content of every element at chosen versions; `None` marks an element with no version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub text: Option<String>,
    pub image: Option<String>,
    pub audio: Option<String>,
}

impl Segment {
    /// Creates a segment whose text version 0 is `initial_text`.
    pub fn new(label: impl Into<String>, initial_text: impl Into<String>) -> Self {
        let mut text = VersionedElement::new();
        text.append_and_activate(initial_text);

        Self {
            label: label.into(),
            position: 0,
            text,
            image: VersionedElement::new(),
            audio: VersionedElement::new(),
        }
    }

    pub(crate) fn from_parts(
        label: String,
        position: usize,
        text: VersionedElement,
        image: VersionedElement,
        audio: VersionedElement,
    ) -> Self {
        Self {
            label,
            position,
            text,
            image,
            audio,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn set_label(&mut self, label: String) {
        self.label = label;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    /// Ready once the text has an active version.
    pub fn is_ready(&self) -> bool {
        self.text.current().is_some()
    }

    pub fn element(&self, kind: ElementKind) -> &VersionedElement {
        match kind {
            ElementKind::Text => &self.text,
            ElementKind::Image => &self.image,
            ElementKind::Audio => &self.audio,
        }
    }

    fn element_mut(&mut self, kind: ElementKind) -> &mut VersionedElement {
        match kind {
            ElementKind::Text => &mut self.text,
            ElementKind::Image => &mut self.image,
            ElementKind::Audio => &mut self.audio,
        }
    }

    pub fn current(&self, kind: ElementKind) -> Option<&str> {
        self.element(kind).current()
    }

    /// Produces the first image and audio versions from the active text, concurrently.
    ///
    /// Failed media production is logged and leaves that element unset; only missing text
    /// is an error.
    pub async fn initialize(&mut self, context: &GenerationContext) -> SequenceResult<()> {
        let sentence = self.require_text("segment-initialize")?;
        let image_name = self.asset_name(self.image.len());
        let audio_name = self.asset_name(self.audio.len());

        let (image, audio) = futures::join!(
            produce_image(context, &sentence, None, image_name),
            produce_audio(context, &sentence, None, audio_name),
        );

        self.absorb(ElementKind::Image, image);
        self.absorb(ElementKind::Audio, audio);
        Ok(())
    }

    /// Regenerates one element using this segment's own text as the script context.
    pub async fn regenerate(
        &mut self,
        context: &GenerationContext,
        kind: ElementKind,
        prompt_override: Option<&str>,
    ) -> SequenceResult<usize> {
        let script = self
            .text
            .current()
            .map(|sentence| format!("{sentence}\n"))
            .unwrap_or_default();
        self.regenerate_in_script(context, kind, prompt_override, &script)
            .await
    }

    /// Produces a new version of `kind` and activates it. On failure nothing changes.
    ///
    /// Without an override, text is rephrased within `script`, images are drawn from a
    /// description of the active text and audio speaks the active text. For audio the
    /// override is the text to speak.
    pub async fn regenerate_in_script(
        &mut self,
        context: &GenerationContext,
        kind: ElementKind,
        prompt_override: Option<&str>,
        script: &str,
    ) -> SequenceResult<usize> {
        let sentence = match (self.text.current(), prompt_override) {
            (Some(sentence), _) => sentence.to_string(),
            (None, Some(_)) => String::new(),
            (None, None) => self.require_text("segment-regenerate")?,
        };
        let asset_name = self.asset_name(self.element(kind).len());

        let content = match kind {
            ElementKind::Text => {
                let prompt = match prompt_override {
                    Some(prompt) => prompt.to_string(),
                    None => context.prompts().regenerate_prompt(script, &sentence),
                };
                let reply = context
                    .gateway()
                    .script(prompt)
                    .await
                    .context(ProducerSnafu {
                        stage: "segment-regenerate",
                    })?;
                single_line(&reply, "segment-regenerate-text")?
            }
            ElementKind::Image => produce_image(context, &sentence, prompt_override, asset_name)
                .await
                .context(ProducerSnafu {
                    stage: "segment-regenerate",
                })?,
            ElementKind::Audio => produce_audio(context, &sentence, prompt_override, asset_name)
                .await
                .context(ProducerSnafu {
                    stage: "segment-regenerate",
                })?,
        };
        let index = self.element_mut(kind).append_and_activate(content);
        tracing::info!(label = %self.label, kind = %kind, version = index, "element regenerated");
        Ok(index)
    }

    pub fn switch(&mut self, kind: ElementKind, version: usize) -> bool {
        self.element_mut(kind).select(version)
    }

    /// Content at the given versions, each defaulting to the active one.
    pub fn snapshot(
        &self,
        text_version: Option<usize>,
        image_version: Option<usize>,
        audio_version: Option<usize>,
    ) -> SequenceResult<Snapshot> {
        Ok(Snapshot {
            text: pick(&self.text, ElementKind::Text, text_version)?,
            image: pick(&self.image, ElementKind::Image, image_version)?,
            audio: pick(&self.audio, ElementKind::Audio, audio_version)?,
        })
    }

    pub fn to_json(&self) -> SequenceResult<serde_json::Value> {
        serde_json::to_value(self).context(SerializeSnafu {
            stage: "segment-to-json",
            what: "segment",
        })
    }

    fn asset_name(&self, version: usize) -> String {
        format!("{}_{version}", self.label)
    }

    fn require_text(&self, stage: &'static str) -> SequenceResult<String> {
        self.text
            .current()
            .map(str::to_string)
            .context(NotReadySnafu {
                stage,
                position: self.position,
            })
    }

    fn absorb(&mut self, kind: ElementKind, outcome: ProducerResult<String>) {
        match outcome {
            Ok(content) => {
                let index = self.element_mut(kind).append_and_activate(content);
                tracing::debug!(label = %self.label, kind = %kind, version = index, "element produced");
            }
            Err(error) => {
                tracing::warn!(
                    label = %self.label,
                    kind = %kind,
                    error = %error,
                    "element production failed; element stays unset"
                );
            }
        }
    }
}

/// A script reply usable as one segment's text: trimmed, non-empty and free of line breaks.
pub(crate) fn single_line(reply: &str, stage: &'static str) -> SequenceResult<String> {
    let sentence = reply.trim();
    ensure!(
        !sentence.is_empty() && !sentence.contains(['\n', '\r']),
        UnusableSentenceSnafu {
            stage,
            reply: reply.to_string(),
        }
    );
    Ok(sentence.to_string())
}

fn pick(
    element: &VersionedElement,
    kind: ElementKind,
    version: Option<usize>,
) -> SequenceResult<Option<String>> {
    match version {
        Some(version) => element
            .get(version)
            .map(|content| Some(content.to_string()))
            .context(MissingVersionSnafu {
                stage: "segment-snapshot",
                kind,
                version,
            }),
        None => Ok(element.current().map(str::to_string)),
    }
}

async fn produce_image(
    context: &GenerationContext,
    sentence: &str,
    prompt_override: Option<&str>,
    asset_name: String,
) -> ProducerResult<String> {
    let prompt = match prompt_override {
        Some(prompt) => prompt.to_string(),
        None => describe_image(context, sentence).await,
    };
    context.gateway().image(prompt, asset_name).await
}

// Falls back to the sentence itself when no description can be had.
async fn describe_image(context: &GenerationContext, sentence: &str) -> String {
    let request = context.prompts().image_description_prompt(sentence);
    match context.gateway().script(request).await {
        Ok(description) if !description.trim().is_empty() => description.trim().to_string(),
        Ok(_) => sentence.to_string(),
        Err(error) => {
            tracing::warn!(error = %error, "image description failed; prompting with the sentence");
            sentence.to_string()
        }
    }
}

async fn produce_audio(
    context: &GenerationContext,
    sentence: &str,
    text_override: Option<&str>,
    asset_name: String,
) -> ProducerResult<String> {
    context
        .gateway()
        .speech(
            context.voice_id(),
            text_override.unwrap_or(sentence),
            asset_name,
        )
        .await
}
