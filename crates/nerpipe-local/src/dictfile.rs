//! Dictionary file readers and bulk import into a cache.

use crate::textprep::lookup_key;
use nerpipe_core::{Cache, Error, Lookup, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::str::FromStr;

/// One dictionary concept: its identifiers by kind and the names it is known by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DictionaryEntry {
    pub identifiers: BTreeMap<String, String>,
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictFormat {
    PubChem,
    Leadmine,
}

impl FromStr for DictFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pubchem" => Ok(Self::PubChem),
            "leadmine" => Ok(Self::Leadmine),
            other => Err(Error::Config(format!("unknown dictionary format: {other}"))),
        }
    }
}

const IDENTIFIER_PATTERNS: &[(&str, &str)] = &[
    ("schembl", r"SCHEMBL\d+"),
    ("dtxsid", r"DTXSID\d{8}"),
    ("chembl", r"CHEMBL\d+"),
    ("chebi", r"CHEBI:\d+"),
    ("lmfa", r"LMFA\d{8}"),
    ("hy", r"HY-\d+?[A-Z]?"),
    ("cs", r"CS-.*"),
    ("ft", r"FT-\d{7}"),
    ("wikidata", r"Q\d+"),
    ("acmc", r"ACMC-\w+"),
    ("albb", r"ALBB-\d{6}"),
    ("akos", r"AKOS\d{9}"),
    ("cas", r"\d+-\d+-\d+"),
    ("einces", r"EINCES \d+-\d+-\d+"),
    ("ec", r"EC \d+-\d+-\d+"),
];

/// Chemical identifier recognisers, each anchored to the whole value.
#[derive(Debug, Clone)]
pub struct IdentifierPatterns {
    patterns: Vec<(&'static str, Regex)>,
}

impl IdentifierPatterns {
    pub fn new() -> Result<Self> {
        let patterns = IDENTIFIER_PATTERNS
            .iter()
            .map(|(kind, source)| {
                Regex::new(&format!("^(?:{source})$"))
                    .map(|re| (*kind, re))
                    .map_err(|e| Error::Config(e.to_string()))
            })
            .collect::<Result<_>>()?;
        Ok(Self { patterns })
    }

    /// Identifier kind of `value`, or `None` for a synonym.
    pub fn kind(&self, value: &str) -> Option<&'static str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(value))
            .map(|(kind, _)| *kind)
    }
}

struct Group {
    id: u64,
    entry: DictionaryEntry,
}

/// Streams entries from `<id>\t<value>` lines, grouping consecutive lines with the same id.
pub struct PubChemReader<R> {
    lines: std::io::Lines<R>,
    line_no: usize,
    current: Option<Group>,
    patterns: IdentifierPatterns,
}

impl<R: BufRead> PubChemReader<R> {
    pub fn new(reader: R) -> Result<Self> {
        Ok(Self {
            lines: reader.lines(),
            line_no: 0,
            current: None,
            patterns: IdentifierPatterns::new()?,
        })
    }

    fn parse_line(&self, line: &str) -> Result<(u64, String)> {
        let (id, value) = line.split_once('\t').ok_or_else(|| {
            Error::Decode(format!("line {}: expected <id>\\t<value>", self.line_no))
        })?;
        let id = id
            .trim()
            .parse()
            .map_err(|e| Error::Decode(format!("line {}: bad id {id:?}: {e}", self.line_no)))?;
        Ok((id, value.trim().to_string()))
    }

    fn add(patterns: &IdentifierPatterns, group: &mut Group, value: String) {
        match patterns.kind(&value) {
            Some(kind) => {
                group.entry.identifiers.entry(kind.to_string()).or_insert(value);
            }
            None => group.entry.synonyms.push(value),
        }
    }
}

impl<R: BufRead> Iterator for PubChemReader<R> {
    type Item = Result<DictionaryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next() {
                None => return self.current.take().map(|g| Ok(g.entry)),
                Some(Err(e)) => return Some(Err(Error::InputRead(e.to_string()))),
                Some(Ok(line)) => line,
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let (id, value) = match self.parse_line(&line) {
                Ok(parsed) => parsed,
                Err(e) => return Some(Err(e)),
            };

            if self.current.as_ref().is_some_and(|g| g.id == id) {
                if let Some(group) = self.current.as_mut() {
                    Self::add(&self.patterns, group, value);
                }
                continue;
            }
            let mut group = Group {
                id,
                entry: DictionaryEntry::default(),
            };
            group
                .entry
                .identifiers
                .insert("pubchem".to_string(), id.to_string());
            Self::add(&self.patterns, &mut group, value);
            if let Some(done) = self.current.replace(group) {
                return Some(Ok(done.entry));
            }
        }
    }
}

/// Streams entries from `<synonym>[\t<synonym>…]\t<identifier>` lines; `#` starts a comment.
pub struct LeadmineReader<R> {
    lines: std::io::Lines<R>,
    line_no: usize,
}

impl<R: BufRead> LeadmineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for LeadmineReader<R> {
    type Item = Result<DictionaryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(Error::InputRead(e.to_string()))),
            };
            self.line_no += 1;
            let content = line.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }
            let mut columns: Vec<&str> = content
                .split('\t')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect();
            let Some(identifier) = columns.pop().filter(|_| !columns.is_empty()) else {
                return Some(Err(Error::Decode(format!(
                    "line {}: expected <synonym>\\t<identifier>",
                    self.line_no
                ))));
            };
            let mut entry = DictionaryEntry::default();
            entry
                .identifiers
                .insert("leadmine".to_string(), identifier.to_string());
            entry.synonyms = columns.into_iter().map(str::to_string).collect();
            return Some(Ok(entry));
        }
    }
}

/// Open a reader of the given format.
pub fn read_entries<'a, R: BufRead + 'a>(
    format: DictFormat,
    reader: R,
) -> Result<Box<dyn Iterator<Item = Result<DictionaryEntry>> + 'a>> {
    Ok(match format {
        DictFormat::PubChem => Box::new(PubChemReader::new(reader)?),
        DictFormat::Leadmine => Box::new(LeadmineReader::new(reader)),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub entries: usize,
    pub keys: usize,
}

/// Write every synonym of every entry into `cache` under its lookup key.
///
/// Sets are batched and flushed whenever `pipeline_size` are queued.
pub async fn import<I>(
    entries: I,
    dictionary: &str,
    cache: &dyn Cache,
    pipeline_size: usize,
    exact_match: bool,
) -> Result<ImportSummary>
where
    I: IntoIterator<Item = Result<DictionaryEntry>>,
{
    let pipeline_size = pipeline_size.max(1);
    let mut pipe = cache.new_set_pipeline(pipeline_size);
    let mut summary = ImportSummary::default();
    for entry in entries {
        let entry = entry?;
        summary.entries += 1;
        let value = Lookup {
            dictionary: dictionary.to_string(),
            identifiers: entry.identifiers,
            metadata: serde_json::Value::Null,
        }
        .to_vec()?;
        for synonym in &entry.synonyms {
            let key = lookup_key(synonym, exact_match);
            if key.is_empty() {
                continue;
            }
            pipe.set(key, value.clone());
            summary.keys += 1;
            if pipe.size() >= pipeline_size {
                pipe.exec().await?;
                tracing::debug!(dictionary, keys = summary.keys, "flushed import pipeline");
            }
        }
    }
    pipe.exec().await?;
    tracing::info!(
        dictionary,
        cache = cache.name(),
        entries = summary.entries,
        keys = summary.keys,
        "dictionary import done"
    );
    Ok(summary)
}
