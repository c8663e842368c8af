use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use crate::quark::Quark;

/// Word counts over a corpus, in a stable order.
pub type Vocabulary = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub word: String,
    /// Gold class id, only consulted by restricted passes.
    pub label: Option<usize>,
}

impl Token {
    pub fn new(word: &str, label: Option<usize>) -> Self {
        Self { word: word.to_string(), label }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequence {
    pub tokens: Vec<Token>,
}

impl Sequence {
    pub fn labeled<S: AsRef<str>>(words: &[S], labels: &[usize]) -> Self {
        let tokens = words.iter().zip(labels).map(|(w, &l)| Token::new(w.as_ref(), Some(l))).collect();
        Self { tokens }
    }

    pub fn unlabeled<S: AsRef<str>>(words: &[S]) -> Self {
        let tokens = words.iter().map(|w| Token::new(w.as_ref(), None)).collect();
        Self { tokens }
    }

    pub fn push(&mut self, word: &str, label: Option<usize>) {
        self.tokens.push(Token::new(word, label));
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(|t| t.word.as_str())
    }
}

/// An ordered collection of sequences sharing one label table.
///
/// Iteration order is significant: training visits sequences in order.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub v: Vec<Sequence>,
    pub labels: Quark,
}

impl Corpus {
    pub fn new(labels: Quark) -> Self {
        Self { v: Vec::new(), labels }
    }

    pub fn push(&mut self, seq: Sequence) {
        self.v.push(seq);
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Sequence> {
        self.v.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sequence> {
        self.v.iter()
    }

    pub fn vocabulary(&self) -> Vocabulary {
        let mut vocab = Vocabulary::new();
        for seq in &self.v {
            for word in seq.words() {
                *vocab.entry(word.to_string()).or_insert(0.0) += 1.0;
            }
        }
        vocab
    }

    /// Total number of tokens.
    pub fn word_count(&self) -> usize {
        self.v.iter().map(|x| x.len()).sum()
    }

    pub fn max_length(&self) -> usize {
        self.v.iter().map(|x| x.len()).max().unwrap_or_default()
    }

    /// Splits into a head holding `1 - fraction` of the sequences and a
    /// held-out tail with the rest.
    pub fn split(&self, fraction: f64) -> (Corpus, Corpus) {
        let cut = ((self.v.len() as f64) * (1.0 - fraction)).floor() as usize;
        let cut = cut.min(self.v.len());
        let head = Corpus { v: self.v[..cut].to_vec(), labels: self.labels.clone() };
        let tail = Corpus { v: self.v[cut..].to_vec(), labels: self.labels.clone() };
        (head, tail)
    }

    pub fn concat(&self, other: &Corpus) -> Corpus {
        let mut v = self.v.clone();
        v.extend(other.v.iter().cloned());
        Corpus { v, labels: self.labels.clone() }
    }

    /// Rewrites every word through `f`, keeping labels.
    pub fn map_words<F: FnMut(&str) -> String>(&self, mut f: F) -> Corpus {
        let v = self
            .v
            .iter()
            .map(|seq| Sequence {
                tokens: seq.tokens.iter().map(|t| Token { word: f(&t.word), label: t.label }).collect(),
            })
            .collect();
        Corpus { v, labels: self.labels.clone() }
    }

    /// Reads `label<TAB>word` lines; a blank line ends a sequence and a
    /// line without a tab is an unlabeled token.
    pub fn read<R: Read>(&mut self, input: R) -> Result<(), std::io::Error> {
        let mut seq = Sequence::default();
        for line in BufReader::new(input).lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                if let Some((label, word)) = line.split_once('\t') {
                    if word.is_empty() {
                        log::warn!("invalid line: {line}");
                        continue;
                    }
                    let id = self.labels.find_or_insert(label);
                    seq.push(word, Some(id));
                } else {
                    seq.push(line, None);
                }
            } else if !seq.is_empty() {
                self.v.push(std::mem::take(&mut seq));
            }
        }
        if !seq.is_empty() {
            self.v.push(seq);
        }
        Ok(())
    }
}

impl TryFrom<File> for Corpus {
    type Error = std::io::Error;

    fn try_from(file: File) -> Result<Self, Self::Error> {
        let mut corpus = Corpus::default();
        corpus.read(file)?;
        Ok(corpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_sequences() {
        let input = "O\tx\ncompany\ta\ncompany\tb\nO\ty\n\n\ncompany\ta\ncompany\tb\n\nfoo\nbar\n";
        let mut corpus = Corpus::default();
        corpus.read(input.as_bytes()).unwrap();
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.labels.to_id("company"), Some(1));
        assert_eq!(corpus.v[0].tokens[1], Token::new("a", Some(1)));
        assert_eq!(corpus.v[2].tokens[0], Token::new("foo", None));
        assert_eq!(corpus.word_count(), 8);
        assert_eq!(corpus.max_length(), 4);
    }

    #[test]
    fn vocabulary_counts() {
        let mut corpus = Corpus::default();
        corpus.push(Sequence::unlabeled(&["a", "b", "a"]));
        corpus.push(Sequence::unlabeled(&["c"]));
        let vocab = corpus.vocabulary();
        assert_eq!(vocab["a"], 2.0);
        assert_eq!(vocab["c"], 1.0);
        assert_eq!(vocab.len(), 3);
    }

    #[test]
    fn split_keeps_order() {
        let mut corpus = Corpus::default();
        for w in ["a", "b", "c", "d"] {
            corpus.push(Sequence::unlabeled(&[w]));
        }
        let (head, tail) = corpus.split(0.25);
        assert_eq!(head.len(), 3);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail.v[0].tokens[0].word, "d");
        assert_eq!(head.concat(&tail).len(), 4);
    }
}
