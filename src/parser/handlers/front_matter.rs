/// Front matter detection for Markdown files.
///
/// Supports `---` delimited YAML and `+++` delimited TOML blocks at the very
/// start of a document.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontMatterFormat {
    Yaml,
    Toml,
}

impl fmt::Display for FrontMatterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Yaml => "yaml",
            Self::Toml => "toml",
        })
    }
}

/// A front matter block located in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontMatter<'a> {
    pub format: FrontMatterFormat,
    /// Text between the delimiters.
    pub body: &'a str,
    /// Byte offset just past the closing delimiter line.
    pub end: usize,
}

/// Locate front matter. Unclosed blocks are treated as ordinary content.
pub fn locate(content: &str) -> Option<FrontMatter<'_>> {
    let mut lines = content.split_inclusive('\n');
    let first = lines.next()?;
    let (format, delimiter) = match first.trim_end() {
        "---" => (FrontMatterFormat::Yaml, "---"),
        "+++" => (FrontMatterFormat::Toml, "+++"),
        _ => return None,
    };

    let body_start = first.len();
    let mut offset = body_start;
    for line in lines {
        let line_end = offset + line.len();
        if line.trim_end() == delimiter {
            return Some(FrontMatter {
                format,
                body: &content[body_start..offset],
                end: line_end,
            });
        }
        offset = line_end;
    }
    None
}

/// Top-level keys of the block, in document order where the format keeps it.
pub fn keys(front_matter: &FrontMatter<'_>) -> Result<Vec<String>, String> {
    match front_matter.format {
        FrontMatterFormat::Yaml => {
            if front_matter.body.trim().is_empty() {
                return Ok(Vec::new());
            }
            let value: serde_yaml::Value =
                serde_yaml::from_str(front_matter.body).map_err(|e| e.to_string())?;
            match value {
                serde_yaml::Value::Mapping(map) => Ok(map
                    .keys()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()),
                serde_yaml::Value::Null => Ok(Vec::new()),
                _ => Err("front matter is not a mapping".to_string()),
            }
        }
        FrontMatterFormat::Toml => {
            let table: toml::Table = front_matter.body.parse().map_err(|e: toml::de::Error| e.to_string())?;
            Ok(table.keys().cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_front_matter() {
        assert!(locate("# Hello\n\nWorld").is_none());
        assert!(locate("---\nunclosed: true\n").is_none());
    }

    #[test]
    fn test_yaml_front_matter() {
        let content = "---\ndomain: backend\ntags: [auth, db]\n---\n# Doc\n";
        let fm = locate(content).unwrap();
        assert_eq!(fm.format, FrontMatterFormat::Yaml);
        assert_eq!(fm.body, "domain: backend\ntags: [auth, db]\n");
        assert_eq!(&content[fm.end..], "# Doc\n");
        assert_eq!(keys(&fm).unwrap(), vec!["domain", "tags"]);
    }

    #[test]
    fn test_toml_front_matter() {
        let content = "+++\ntitle = \"x\"\ndraft = true\n+++\nbody\n";
        let fm = locate(content).unwrap();
        assert_eq!(fm.format.to_string(), "toml");
        let mut found = keys(&fm).unwrap();
        found.sort();
        assert_eq!(found, vec!["draft", "title"]);
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let fm = locate("---\n: [unbalanced\n---\n").unwrap();
        assert!(keys(&fm).is_err());
    }
}
