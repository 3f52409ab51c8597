//! Tokenizer and label encoder state.
//!
//! Both types persist through [`ArtifactState`], which the artifact codec
//! invokes without knowing the concrete type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::errors::{TgError, TgResult};

/// Serializable state of an artifact component.
pub trait ArtifactState: Sized {
    type State: Serialize + DeserializeOwned;

    fn to_state(&self) -> Self::State;

    /// Rebuilds an instance, rejecting inconsistent state.
    fn from_state(state: Self::State) -> TgResult<Self>;
}

pub const PAD_TOKEN: &str = "<PAD>";
pub const OOV_TOKEN: &str = "<UNK>";

/// Maps text to token indices
#[derive(Debug, Clone, PartialEq)]
pub struct Tokenizer {
    char_level: bool,
    oov_token: String,
    token_to_index: HashMap<String, u32>,
    index_to_token: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerState {
    pub char_level: bool,
    pub oov_token: String,
    pub token_to_index: BTreeMap<String, u32>,
}

impl Tokenizer {
    pub fn new(char_level: bool) -> Self {
        let mut tokenizer = Self {
            char_level,
            oov_token: OOV_TOKEN.to_string(),
            token_to_index: HashMap::new(),
            index_to_token: Vec::new(),
        };
        tokenizer.push(PAD_TOKEN.to_string());
        tokenizer.push(OOV_TOKEN.to_string());
        tokenizer
    }

    fn push(&mut self, token: String) {
        let index = self.index_to_token.len() as u32;
        self.token_to_index.insert(token.clone(), index);
        self.index_to_token.push(token);
    }

    fn split<'a>(&self, text: &'a str) -> Vec<&'a str> {
        if self.char_level {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(' ').filter(|t| !t.is_empty()).collect()
        }
    }

    /// Adds tokens by descending frequency, keeping at most `max_tokens`
    /// entries in total (special tokens included).
    pub fn fit_on_texts<S: AsRef<str>>(&mut self, texts: &[S], max_tokens: Option<usize>) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for text in texts {
            for token in self.split(text.as_ref()) {
                *counts.entry(token).or_default() += 1;
            }
        }

        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        // ties broken alphabetically so fitting is deterministic
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let budget = max_tokens.map(|n| n.saturating_sub(self.len()));
        let new_tokens: Vec<String> = ranked
            .into_iter()
            .filter(|(token, _)| !self.token_to_index.contains_key(*token))
            .take(budget.unwrap_or(usize::MAX))
            .map(|(token, _)| token.to_string())
            .collect();
        for token in new_tokens {
            self.push(token);
        }
    }

    pub fn texts_to_sequences<S: AsRef<str>>(&self, texts: &[S]) -> Vec<Vec<u32>> {
        let oov = self.token_to_index[&self.oov_token];
        texts
            .iter()
            .map(|text| {
                self.split(text.as_ref())
                    .into_iter()
                    .map(|token| self.token_to_index.get(token).copied().unwrap_or(oov))
                    .collect()
            })
            .collect()
    }

    pub fn token(&self, index: u32) -> Option<&str> {
        self.index_to_token.get(index as usize).map(String::as_str)
    }

    pub fn char_level(&self) -> bool {
        self.char_level
    }

    pub fn len(&self) -> usize {
        self.index_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_to_token.is_empty()
    }
}

impl ArtifactState for Tokenizer {
    type State = TokenizerState;

    fn to_state(&self) -> TokenizerState {
        TokenizerState {
            char_level: self.char_level,
            oov_token: self.oov_token.clone(),
            token_to_index: self
                .token_to_index
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    fn from_state(state: TokenizerState) -> TgResult<Self> {
        let index_to_token = dense_index(&state.token_to_index, "token")?;
        if !state.token_to_index.contains_key(&state.oov_token) {
            return Err(TgError::Validation(format!(
                "oov token '{}' missing from vocabulary",
                state.oov_token
            )));
        }
        Ok(Self {
            char_level: state.char_level,
            oov_token: state.oov_token,
            token_to_index: state.token_to_index.into_iter().collect(),
            index_to_token,
        })
    }
}

/// Encodes tag lists as multi-hot vectors
#[derive(Debug, Clone, PartialEq)]
pub struct MultiLabelEncoder {
    class_to_index: HashMap<String, usize>,
    classes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEncoderState {
    pub class_to_index: BTreeMap<String, u32>,
}

impl MultiLabelEncoder {
    /// Encoder over the sorted, de-duplicated set of tags seen in `labels`.
    pub fn fit<S: AsRef<str>>(labels: &[Vec<S>]) -> Self {
        let mut classes: Vec<String> = labels
            .iter()
            .flatten()
            .map(|s| s.as_ref().to_string())
            .collect();
        classes.sort();
        classes.dedup();
        let class_to_index = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self {
            class_to_index,
            classes,
        }
    }

    /// Unknown tags are ignored.
    pub fn encode<S: AsRef<str>>(&self, labels: &[Vec<S>]) -> Vec<Vec<u8>> {
        labels
            .iter()
            .map(|tags| {
                let mut row = vec![0u8; self.classes.len()];
                for tag in tags {
                    if let Some(&i) = self.class_to_index.get(tag.as_ref()) {
                        row[i] = 1;
                    }
                }
                row
            })
            .collect()
    }

    pub fn decode(&self, rows: &[Vec<u8>]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(_, &v)| v == 1)
                    .filter_map(|(i, _)| self.classes.get(i).cloned())
                    .collect()
            })
            .collect()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ArtifactState for MultiLabelEncoder {
    type State = LabelEncoderState;

    fn to_state(&self) -> LabelEncoderState {
        LabelEncoderState {
            class_to_index: self
                .class_to_index
                .iter()
                .map(|(k, v)| (k.clone(), *v as u32))
                .collect(),
        }
    }

    fn from_state(state: LabelEncoderState) -> TgResult<Self> {
        let classes = dense_index(&state.class_to_index, "class")?;
        Ok(Self {
            class_to_index: state
                .class_to_index
                .into_iter()
                .map(|(k, v)| (k, v as usize))
                .collect(),
            classes,
        })
    }
}

/// Inverts a name → index map whose indices must be exactly `0..len`.
fn dense_index(map: &BTreeMap<String, u32>, what: &str) -> TgResult<Vec<String>> {
    let mut slots: Vec<Option<String>> = vec![None; map.len()];
    for (name, &index) in map {
        let len = map.len();
        let slot = slots.get_mut(index as usize).ok_or_else(|| {
            TgError::Validation(format!(
                "{what} index {index} out of range for {len} entries"
            ))
        })?;
        if let Some(other) = slot {
            return Err(TgError::Validation(format!(
                "{what} index {index} assigned to both '{other}' and '{name}'"
            )));
        }
        *slot = Some(name.clone());
    }
    Ok(slots.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_tokenizer_fit_and_encode() {
        let mut tokenizer = Tokenizer::new(false);
        tokenizer.fit_on_texts(&["deep learning", "deep models"], None);

        assert_eq!(tokenizer.len(), 5);
        // "deep" is most frequent so it gets the first free index
        assert_eq!(tokenizer.token(2), Some("deep"));
        let sequences = tokenizer.texts_to_sequences(&["deep unknown"]);
        assert_eq!(sequences, vec![vec![2, 1]]);
    }

    #[test]
    fn test_char_tokenizer_respects_budget() {
        let mut tokenizer = Tokenizer::new(true);
        tokenizer.fit_on_texts(&["aaabbc"], Some(4));
        assert_eq!(tokenizer.len(), 4);
        assert_eq!(tokenizer.texts_to_sequences(&["abc"]), vec![vec![2, 3, 1]]);
    }

    #[test]
    fn test_tokenizer_state_roundtrip() {
        let mut tokenizer = Tokenizer::new(false);
        tokenizer.fit_on_texts(&["a b c"], None);
        let restored = Tokenizer::from_state(tokenizer.to_state()).unwrap();
        assert_eq!(restored, tokenizer);
    }

    #[test]
    fn test_tokenizer_state_rejects_holes() {
        let mut token_to_index = BTreeMap::new();
        token_to_index.insert(PAD_TOKEN.to_string(), 0);
        token_to_index.insert(OOV_TOKEN.to_string(), 5);
        let state = TokenizerState {
            char_level: false,
            oov_token: OOV_TOKEN.to_string(),
            token_to_index,
        };
        assert!(Tokenizer::from_state(state).is_err());
    }

    #[test]
    fn test_label_encoder_encode_decode() {
        let labels = vec![vec!["mlops", "computer-vision"], vec!["natural-language-processing"]];
        let encoder = MultiLabelEncoder::fit(&labels);

        assert_eq!(encoder.classes()[0], "computer-vision");
        let encoded = encoder.encode(&labels);
        assert_eq!(encoded[0], vec![1, 1, 0]);
        assert_eq!(encoder.decode(&encoded)[1], vec!["natural-language-processing"]);
    }

    #[test]
    fn test_label_encoder_state_roundtrip() {
        let encoder = MultiLabelEncoder::fit(&[vec!["b", "a"], vec!["c"]]);
        let restored = MultiLabelEncoder::from_state(encoder.to_state()).unwrap();
        assert_eq!(restored, encoder);
    }
}
