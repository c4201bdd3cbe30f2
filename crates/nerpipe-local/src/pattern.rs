use crate::textprep::{normalise_snippet, tokenize};
use nerpipe_core::{
    Entity, Error, RecogniseOptions, Recogniser, Result, SnippetEvent, SnippetReceiver,
};
use regex::Regex;
use std::collections::BTreeMap;

/// Matches single normalised tokens against a named set of regular expressions.
///
/// Entities are attributed to the pattern's name, not the recogniser's.
#[derive(Debug, Clone)]
pub struct PatternRecogniser {
    name: String,
    patterns: BTreeMap<String, Regex>,
}

impl PatternRecogniser {
    pub fn new(name: impl Into<String>, patterns: BTreeMap<String, Regex>) -> Self {
        Self {
            name: name.into(),
            patterns,
        }
    }

    /// Compile `(pattern name, regex source)` pairs.
    pub fn compile<'a>(
        name: impl Into<String>,
        sources: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self> {
        let mut patterns = BTreeMap::new();
        for (pattern_name, source) in sources {
            let re = Regex::new(source)
                .map_err(|e| Error::Config(format!("pattern {pattern_name:?}: {e}")))?;
            patterns.insert(pattern_name.to_string(), re);
        }
        Ok(Self::new(name, patterns))
    }
}

#[async_trait::async_trait]
impl Recogniser for PatternRecogniser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognise(
        &self,
        mut input: SnippetReceiver,
        options: RecogniseOptions,
    ) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();
        while let Some(event) = input.recv().await {
            let snippet = match event {
                SnippetEvent::Snippet(snippet) => snippet,
                SnippetEvent::Failed(err) => return Err(err),
                SnippetEvent::End => break,
            };
            tokenize(&snippet, options.exact_match, |mut token| {
                normalise_snippet(&mut token);
                if token.text.is_empty() {
                    return;
                }
                for (pattern_name, re) in &self.patterns {
                    if re.is_match(&token.text) {
                        entities.push(Entity::at(&token, pattern_name));
                    }
                }
            });
        }
        Ok(entities)
    }
}
