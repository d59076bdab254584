use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::encoding::TextEncoding;
use crate::Result;

/// Bracketed speaker names (`【…】`) in the Japanese script paired with their
/// localised forms. Strings bound for Big5 get the localised name, strings
/// bound for Shift-JIS get the Japanese one back.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "Vec<(String, String)>", into = "Vec<(String, String)>")]
pub struct NameTable {
    pairs: Vec<(String, String)>,
    to_localised: HashMap<String, String>,
    to_japanese: HashMap<String, String>,
}

impl From<Vec<(String, String)>> for NameTable {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self::from_pairs(pairs)
    }
}

impl From<NameTable> for Vec<(String, String)> {
    fn from(table: NameTable) -> Self {
        table.pairs
    }
}

impl NameTable {
    /// Later pairs win when a name appears twice on either side.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut to_localised = HashMap::new();
        let mut to_japanese = HashMap::new();
        for (jp, local) in &pairs {
            to_localised.insert(jp.clone(), local.clone());
            to_japanese.insert(local.clone(), jp.clone());
        }
        Self {
            pairs,
            to_localised,
            to_japanese,
        }
    }

    /// Reads a JSON array of `[japanese, localised]` pairs.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn substitute(&self, text: &str, target: TextEncoding) -> String {
        if !text.starts_with('【') {
            return text.to_string();
        }
        let Some(close) = text.find('】') else {
            return text.to_string();
        };
        let (name, rest) = text.split_at(close + '】'.len_utf8());
        let table = match target {
            TextEncoding::Big5 => &self.to_localised,
            TextEncoding::Sjis => &self.to_japanese,
        };
        match table.get(name) {
            Some(swapped) => format!("{swapped}{rest}"),
            None => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> NameTable {
        NameTable::from_pairs(vec![
            ("【お兄ちゃん】".into(), "【哥哥】".into()),
            ("【霧寺】".into(), "【霧寺】".into()),
            ("【霧寺が】".into(), "【霧寺】".into()),
        ])
    }

    #[test]
    fn swaps_by_target_encoding() {
        let names = table();
        assert_eq!(
            names.substitute("【お兄ちゃん】「x」", TextEncoding::Big5),
            "【哥哥】「x」"
        );
        assert_eq!(
            names.substitute("【哥哥】「x」", TextEncoding::Sjis),
            "【お兄ちゃん】「x」"
        );
    }

    #[test]
    fn later_pairs_win() {
        assert_eq!(table().substitute("【霧寺】", TextEncoding::Sjis), "【霧寺が】");
    }

    #[test]
    fn leaves_other_text_alone() {
        let names = table();
        assert_eq!(names.substitute("x【哥哥】", TextEncoding::Sjis), "x【哥哥】");
        assert_eq!(names.substitute("【unclosed", TextEncoding::Sjis), "【unclosed");
        assert_eq!(names.substitute("【誰】", TextEncoding::Big5), "【誰】");
    }

    #[test]
    fn loads_json_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        fs::write(&path, r#"[["【ミホ】", "【美保】"]]"#).unwrap();
        let names = NameTable::load(&path).unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names.substitute("【ミホ】", TextEncoding::Big5), "【美保】");
    }
}
