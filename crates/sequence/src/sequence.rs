use futures::future::join_all;
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use storyreel_storage::ElementKind;

use crate::context::GenerationContext;
use crate::error::{OutOfRangeSnafu, ProducerSnafu, SequenceResult, SerializeSnafu};
use crate::segment::{Segment, single_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    Empty,
    Populating,
    Populated,
}

/// Ordered segments whose positions always equal their index.
#[derive(Debug, Clone, Serialize)]
pub struct Sequence {
    name: String,
    state: SequenceState,
    segments: Vec<Segment>,
    #[serde(skip)]
    next_label: u64,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SequenceState::Empty,
            segments: Vec::new(),
            next_label: 0,
        }
    }

    /// Rebuilds a sequence from stored segments, in the given order.
    ///
    /// Segments with an empty label get a fresh one allocated past every label already
    /// in use.
    pub(crate) fn from_segments(name: impl Into<String>, segments: Vec<Segment>) -> Self {
        let mut sequence = Self::new(name);
        let prefix = format!("{}_", sequence.name);
        sequence.next_label = segments
            .iter()
            .filter_map(|segment| segment.label().strip_prefix(&prefix)?.parse::<u64>().ok())
            .map(|number| number + 1)
            .max()
            .unwrap_or(0);

        sequence.segments = segments;
        for index in 0..sequence.segments.len() {
            if sequence.segments[index].label().is_empty() {
                let label = sequence.allocate_label();
                sequence.segments[index].set_label(label);
            }
        }
        sequence.renumber();
        if !sequence.segments.is_empty() {
            sequence.state = SequenceState::Populated;
        }
        sequence
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, position: usize) -> Option<&Segment> {
        self.segments.get(position)
    }

    pub fn segment_mut(&mut self, position: usize) -> Option<&mut Segment> {
        self.segments.get_mut(position)
    }

    /// Next `{name}_{n}` label; one instance never hands out a label twice.
    pub fn allocate_label(&mut self) -> String {
        let label = format!("{}_{}", self.name, self.next_label);
        self.next_label += 1;
        label
    }

    /// A detached segment labelled for this sequence, ready for [`Sequence::insert`].
    pub fn new_segment(&mut self, initial_text: impl Into<String>) -> Segment {
        Segment::new(self.allocate_label(), initial_text)
    }

    /// Asks the script capability for a script and regenerates the sequence from it.
    ///
    /// A failed script request leaves the sequence untouched.
    pub async fn generate_from_subject(
        &mut self,
        context: &GenerationContext,
        subject: Option<&str>,
    ) -> SequenceResult<usize> {
        let prompt = context.prompts().script_prompt(subject);
        self.generate_from_prompt(context, prompt).await
    }

    /// Like [`Sequence::generate_from_subject`] without a subject, steering the script away
    /// from every subject in `covered`.
    pub async fn generate_avoiding(
        &mut self,
        context: &GenerationContext,
        covered: &[String],
    ) -> SequenceResult<usize> {
        let prompt = context.prompts().fresh_script_prompt(covered);
        self.generate_from_prompt(context, prompt).await
    }

    /// Asks the script capability for a few-word subject of the compiled script.
    pub async fn summarize_subject(&self, context: &GenerationContext) -> SequenceResult<String> {
        let prompt = context.prompts().subject_prompt(&self.compiled_script());
        let reply = context
            .gateway()
            .script(prompt)
            .await
            .context(ProducerSnafu {
                stage: "sequence-summarize-subject",
            })?;
        single_line(&reply, "sequence-summarize-subject")
    }

    async fn generate_from_prompt(
        &mut self,
        context: &GenerationContext,
        prompt: String,
    ) -> SequenceResult<usize> {
        let script = context
            .gateway()
            .script(prompt)
            .await
            .context(ProducerSnafu {
                stage: "sequence-generate-script",
            })?;

        Ok(self.generate(context, &script).await)
    }

    /// Replaces every segment with one per non-blank line of `script`, kept verbatim.
    ///
    /// Positions follow line order; media for all segments is then produced concurrently.
    pub async fn generate(&mut self, context: &GenerationContext, script: &str) -> usize {
        self.state = SequenceState::Populating;
        self.segments.clear();

        for line in script.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let segment = self.new_segment(line);
            self.segments.push(segment);
        }
        self.renumber();

        let outcomes = join_all(
            self.segments
                .iter_mut()
                .map(|segment| segment.initialize(context)),
        )
        .await;
        for (position, outcome) in outcomes.into_iter().enumerate() {
            if let Err(error) = outcome {
                tracing::warn!(position, error = %error, "segment initialization failed");
            }
        }

        self.state = SequenceState::Populated;
        tracing::info!(sequence = %self.name, segments = self.segments.len(), "sequence generated");
        self.segments.len()
    }

    /// Inserts at `position` clamped to `[0, len]` and returns the position used.
    pub fn insert(&mut self, segment: Segment, position: usize) -> usize {
        let position = position.min(self.segments.len());
        self.segments.insert(position, segment);
        self.renumber();
        self.state = SequenceState::Populated;
        position
    }

    pub fn remove(&mut self, position: usize) -> SequenceResult<Segment> {
        snafu::ensure!(
            position < self.segments.len(),
            OutOfRangeSnafu {
                stage: "sequence-remove",
                index: position,
                len: self.segments.len(),
            }
        );

        let removed = self.segments.remove(position);
        self.renumber();
        Ok(removed)
    }

    /// Moves the segment at `position` to `new_position` clamped to `[0, len - 1]`.
    ///
    /// Returns `false` without changes when `position` is out of range.
    pub fn move_segment(&mut self, position: usize, new_position: usize) -> bool {
        if position >= self.segments.len() {
            return false;
        }

        let target = new_position.min(self.segments.len() - 1);
        if target != position {
            let segment = self.segments.remove(position);
            self.segments.insert(target, segment);
            self.renumber();
        }
        true
    }

    /// Writes a new sentence for `position` (clamped to `[0, len]`) and inserts it there.
    ///
    /// The prompt asks for an opening sentence at 0, a closing one at `len` and otherwise
    /// a sentence bridging the two neighbours.
    pub async fn generate_insert(
        &mut self,
        context: &GenerationContext,
        position: usize,
    ) -> SequenceResult<usize> {
        let position = position.min(self.segments.len());
        let script = self.compiled_script();
        let prompts = context.prompts();

        let prompt = if position == 0 {
            prompts.beginning_prompt(&script)
        } else if position == self.segments.len() {
            prompts.end_prompt(&script)
        } else {
            let previous = self.segments[position - 1]
                .current(ElementKind::Text)
                .unwrap_or_default();
            let next = self.segments[position]
                .current(ElementKind::Text)
                .unwrap_or_default();
            prompts.between_prompt(&script, previous, next)
        };

        let reply = context
            .gateway()
            .script(prompt)
            .await
            .context(ProducerSnafu {
                stage: "sequence-generate-insert",
            })?;
        let sentence = single_line(&reply, "sequence-generate-insert")?;

        let mut segment = self.new_segment(sentence);
        segment.initialize(context).await?;
        let position = self.insert(segment, position);
        tracing::info!(sequence = %self.name, position, "segment generated and inserted");
        Ok(position)
    }

    /// Regenerates one element of the segment at `position`, with the compiled script as
    /// context for text.
    pub async fn regenerate(
        &mut self,
        context: &GenerationContext,
        position: usize,
        kind: ElementKind,
        prompt_override: Option<&str>,
    ) -> SequenceResult<usize> {
        let script = self.compiled_script();
        let len = self.segments.len();
        let segment = self.segments.get_mut(position).context(OutOfRangeSnafu {
            stage: "sequence-regenerate",
            index: position,
            len,
        })?;

        segment
            .regenerate_in_script(context, kind, prompt_override, &script)
            .await
    }

    pub fn switch(
        &mut self,
        position: usize,
        kind: ElementKind,
        version: usize,
    ) -> SequenceResult<bool> {
        let len = self.segments.len();
        let segment = self.segments.get_mut(position).context(OutOfRangeSnafu {
            stage: "sequence-switch",
            index: position,
            len,
        })?;

        Ok(segment.switch(kind, version))
    }

    /// Active text of every segment in order, one per line.
    pub fn compiled_script(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| segment.current(ElementKind::Text))
            .fold(String::new(), |mut script, sentence| {
                script.push_str(sentence);
                script.push('\n');
                script
            })
    }

    pub fn to_json(&self) -> SequenceResult<serde_json::Value> {
        serde_json::to_value(self).context(SerializeSnafu {
            stage: "sequence-to-json",
            what: "sequence",
        })
    }

    fn renumber(&mut self) {
        for (index, segment) in self.segments.iter_mut().enumerate() {
            segment.set_position(index);
        }
    }
}
