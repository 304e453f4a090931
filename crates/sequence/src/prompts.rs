use serde::{Deserialize, Serialize};

/// Prompt templates sent to the script capability.
///
/// Placeholders: `{script}` is the compiled script, `{sentence}` a segment's active text,
/// `{previous}` and `{next}` the neighbours of an interior insertion, `{subjects}` the
/// subjects already covered, one per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptBook {
    pub script: String,
    pub image_description: String,
    pub regenerate_sentence: String,
    pub sentence_at_beginning: String,
    pub sentence_at_end: String,
    pub sentence_between: String,
    pub covered_subjects: String,
    pub no_covered_subjects: String,
    pub script_subject: String,
}

impl Default for PromptBook {
    fn default() -> Self {
        Self {
            script: "Write a short script for a video essay of about ten sentences. \
                     Put every sentence on its own line and return only the script."
                .to_string(),
            image_description: "An image description is a short sentence that describes the content of an image.\n\
                 For example: \"A large plant in winter conditions, cold, photograph\"\n\
                 or \"A diagram of a molecule, illustration, science\".\n\
                 In the same style, describe IN 20 WORDS OR LESS an image to show during this sentence of a video essay:\n\
                 {sentence}"
                .to_string(),
            regenerate_sentence: "Here is the entire script for context:\n{script}\n\n\
                 With that script in mind, re-word or rephrase this sentence from the script:\n\
                 \"{sentence}\"\n\n\
                 Only return the new rephrased sentence. Do not return the entire script."
                .to_string(),
            sentence_at_beginning: "Here is the entire script for context:\n{script}\n\n\
                 With that script in mind, write a new sentence that will naturally go at the beginning of the script.\n\
                 Only return the new sentence. Do not return the entire script."
                .to_string(),
            sentence_at_end: "Here is the entire script for context:\n{script}\n\n\
                 With that script in mind, write a new sentence that will naturally go at the end of the script.\n\
                 Only return the new sentence. Do not return the entire script."
                .to_string(),
            sentence_between: "Here is the entire script for context:\n{script}\n\n\
                 With that script in mind, write a new sentence that will go between these two sentences:\n\
                 \"{previous}\"\n<Your new sentence here>\n\"{next}\"\n\
                 Only return the new sentence. Do not return the entire script."
                .to_string(),
            covered_subjects: "Here are all topics previously covered. Do not write about any of these:\n\
                 {subjects}\
                 Write the script about any subject not already covered."
                .to_string(),
            no_covered_subjects: "There are no previous subjects. Write about anything!\n".to_string(),
            script_subject: "Determine the subject of the following script. Use no more than five words:\n\
                 {script}"
                .to_string(),
        }
    }
}

impl PromptBook {
    pub fn script_prompt(&self, subject: Option<&str>) -> String {
        match subject.map(str::trim).filter(|subject| !subject.is_empty()) {
            Some(subject) => format!("{}\nWrite the script about {subject}", self.script),
            None => self.script.clone(),
        }
    }

    /// Script prompt without a subject that steers away from `covered`.
    pub fn fresh_script_prompt(&self, covered: &[String]) -> String {
        let listed = covered
            .iter()
            .map(|subject| subject.trim())
            .filter(|subject| !subject.is_empty())
            .fold(String::new(), |mut listed, subject| {
                listed.push_str(subject);
                listed.push('\n');
                listed
            });
        let subjects = if listed.is_empty() {
            self.no_covered_subjects.as_str()
        } else {
            listed.as_str()
        };

        format!(
            "{}\n{}",
            self.script,
            fill(&self.covered_subjects, &[("subjects", subjects)])
        )
    }

    pub fn subject_prompt(&self, script: &str) -> String {
        fill(&self.script_subject, &[("script", script)])
    }

    pub fn image_description_prompt(&self, sentence: &str) -> String {
        fill(&self.image_description, &[("sentence", sentence)])
    }

    pub fn regenerate_prompt(&self, script: &str, sentence: &str) -> String {
        fill(
            &self.regenerate_sentence,
            &[("script", script), ("sentence", sentence)],
        )
    }

    pub fn beginning_prompt(&self, script: &str) -> String {
        fill(&self.sentence_at_beginning, &[("script", script)])
    }

    pub fn end_prompt(&self, script: &str) -> String {
        fill(&self.sentence_at_end, &[("script", script)])
    }

    pub fn between_prompt(&self, script: &str, previous: &str, next: &str) -> String {
        fill(
            &self.sentence_between,
            &[("script", script), ("previous", previous), ("next", next)],
        )
    }
}

// Single pass so substituted text containing `{...}` is never expanded again.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let replacement = after_open.find('}').and_then(|close| {
            let key = &after_open[..close];
            values
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value, close))
        });

        match replacement {
            Some((value, close)) => {
                output.push_str(value);
                rest = &after_open[close + 1..];
            }
            None => {
                output.push('{');
                rest = after_open;
            }
        }
    }

    output.push_str(rest);
    output
}
