//! Source Map v3 generation.
//!
//! Mappings are line-level: each output line that came from a module maps
//! to column 0 of the corresponding source line.

use serde::Serialize;

const B64: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// VLQ-encode a signed integer and append to output string.
pub(crate) fn vlq_encode(value: i64, out: &mut String) {
    #[allow(clippy::cast_sign_loss)]
    let mut v = (if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    }) as u64;
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut digit = (v & 0x1f) as u8;
        v >>= 5;
        if v > 0 {
            digit |= 0x20; // continuation bit
        }
        out.push(B64[digit as usize] as char);
        if v == 0 {
            break;
        }
    }
}

/// Serialized form of a V3 source map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    pub file: String,
    pub sources: Vec<String>,
    pub sources_content: Vec<String>,
    pub names: Vec<String>,
    pub mappings: String,
}

impl SourceMap {
    /// Serialize to JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        // A struct of strings always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Collects sources and line mappings while a chunk is written.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    sources_content: Vec<String>,
    /// (output line, source index, source line), in output order.
    lines: Vec<(u32, u32, u32)>,
}

impl SourceMapBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source file and return its index.
    pub fn add_source(&mut self, path: &str, content: &str) -> u32 {
        let idx = u32::try_from(self.sources.len()).unwrap_or(u32::MAX);
        self.sources.push(path.to_string());
        self.sources_content.push(content.to_string());
        idx
    }

    /// Map `output_line` to the start of `source_line` in source `source_idx`.
    pub fn add_line_mapping(&mut self, output_line: u32, source_idx: u32, source_line: u32) {
        self.lines.push((output_line, source_idx, source_line));
    }

    /// Finish the map for the output file `file`.
    #[must_use]
    pub fn build(mut self, file: &str) -> SourceMap {
        self.lines.sort_unstable();
        self.lines.dedup_by_key(|m| m.0);

        let mut mappings = String::new();
        let mut prev_output_line: u32 = 0;
        let mut prev_source: i64 = 0;
        let mut prev_source_line: i64 = 0;

        for &(output_line, source_idx, source_line) in &self.lines {
            // Semicolons separate output lines; unmapped lines stay empty
            while prev_output_line < output_line {
                mappings.push(';');
                prev_output_line += 1;
            }
            // Output column resets on every line; source column is always 0
            vlq_encode(0, &mut mappings);
            vlq_encode(i64::from(source_idx) - prev_source, &mut mappings);
            vlq_encode(i64::from(source_line) - prev_source_line, &mut mappings);
            vlq_encode(0, &mut mappings);

            prev_source = i64::from(source_idx);
            prev_source_line = i64::from(source_line);
        }

        SourceMap {
            version: 3,
            file: file.to_string(),
            sources: self.sources,
            sources_content: self.sources_content,
            names: Vec::new(),
            mappings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlq(value: i64) -> String {
        let mut out = String::new();
        vlq_encode(value, &mut out);
        out
    }

    #[test]
    fn test_vlq_encode() {
        assert_eq!(vlq(0), "A");
        assert_eq!(vlq(1), "C");
        assert_eq!(vlq(-1), "D");
        assert_eq!(vlq(15), "e");
        assert_eq!(vlq(16), "gB");
        assert_eq!(vlq(123), "2H");
    }

    #[test]
    fn test_line_mappings() {
        let mut builder = SourceMapBuilder::new();
        let a = builder.add_source("src/a.js", "one\ntwo\n");
        let b = builder.add_source("src/b.js", "three\n");
        builder.add_line_mapping(1, a, 0);
        builder.add_line_mapping(2, a, 1);
        builder.add_line_mapping(4, b, 0);

        let map = builder.build("a.js");
        // line 0 unmapped; line 3 unmapped
        assert_eq!(map.mappings, ";AAAA;AACA;;ACDA");
        assert_eq!(map.sources, vec!["src/a.js", "src/b.js"]);
        assert_eq!(map.sources_content[1], "three\n");
    }

    #[test]
    fn test_json_shape() {
        let map = SourceMapBuilder::new().build("out.js");
        let json: serde_json::Value = serde_json::from_str(&map.to_json()).unwrap();
        assert_eq!(json["version"], 3);
        assert_eq!(json["file"], "out.js");
        assert!(json["sourcesContent"].as_array().unwrap().is_empty());
        assert_eq!(json["mappings"], "");
    }
}
