use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SkillInfo {
    pub name: String,
    pub path: PathBuf,
    pub source: String,
}

/// Loads skill bodies from `workspace/skills/<name>/SKILL.md`, falling back
/// to a built-in skills directory. Workspace skills shadow built-ins.
#[derive(Debug, Clone)]
pub struct SkillsLoader {
    workspace_skills: PathBuf,
    builtin_skills: PathBuf,
}

impl SkillsLoader {
    pub fn new(workspace: PathBuf, builtin_skills_dir: Option<PathBuf>) -> Self {
        let builtin_skills = builtin_skills_dir
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("skills"));
        Self {
            workspace_skills: workspace.join("skills"),
            builtin_skills,
        }
    }

    pub fn list_skills(&self, filter_unavailable: bool) -> Vec<SkillInfo> {
        let mut skills = Vec::new();
        let mut seen = BTreeSet::new();
        self.collect_from_dir(&self.workspace_skills, "workspace", &mut seen, &mut skills);
        self.collect_from_dir(&self.builtin_skills, "builtin", &mut seen, &mut skills);

        if filter_unavailable {
            skills
                .into_iter()
                .filter(|skill| self.requirements_met(&self.skill_metadata_value(&skill.name)))
                .collect()
        } else {
            skills
        }
    }

    fn collect_from_dir(
        &self,
        dir: &Path,
        source: &str,
        seen: &mut BTreeSet<String>,
        out: &mut Vec<SkillInfo>,
    ) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
            else {
                continue;
            };
            if seen.contains(&name) {
                continue;
            }
            let skill_file = path.join("SKILL.md");
            if !skill_file.exists() {
                continue;
            }
            seen.insert(name.clone());
            out.push(SkillInfo {
                name,
                path: skill_file,
                source: source.to_string(),
            });
        }
    }

    pub fn load_skill(&self, name: &str) -> Option<String> {
        for base in [&self.workspace_skills, &self.builtin_skills] {
            let path = base.join(name).join("SKILL.md");
            if path.exists() {
                return std::fs::read_to_string(path).ok();
            }
        }
        None
    }

    pub fn load_skills_for_context(&self, skill_names: &[String]) -> String {
        let mut parts = Vec::new();
        for name in skill_names {
            if let Some(content) = self.load_skill(name) {
                let content = strip_frontmatter(&content);
                parts.push(format!("### Skill: {name}\n\n{content}"));
            }
        }
        parts.join("\n\n---\n\n")
    }

    /// XML summary of every known skill, availability included, so the
    /// model can decide which SKILL.md to pull in with read_file.
    pub fn build_skills_summary(&self) -> String {
        let skills = self.list_skills(false);
        if skills.is_empty() {
            return String::new();
        }

        let mut lines = vec!["<skills>".to_string()];
        for skill in skills {
            let meta = self.get_skill_metadata(&skill.name).unwrap_or_default();
            let desc = meta
                .get("description")
                .cloned()
                .unwrap_or_else(|| skill.name.clone());
            let meta_value = self.skill_metadata_value(&skill.name);
            let available = self.requirements_met(&meta_value);

            lines.push(format!(
                "  <skill available=\"{}\">",
                if available { "true" } else { "false" }
            ));
            lines.push(format!("    <name>{}</name>", escape_xml(&skill.name)));
            lines.push(format!(
                "    <description>{}</description>",
                escape_xml(&desc)
            ));
            lines.push(format!(
                "    <location>{}</location>",
                escape_xml(&skill.path.display().to_string())
            ));
            if !available {
                let missing = self.missing_requirements(&meta_value);
                if !missing.is_empty() {
                    lines.push(format!("    <requires>{}</requires>", escape_xml(&missing)));
                }
            }
            lines.push("  </skill>".to_string());
        }
        lines.push("</skills>".to_string());
        lines.join("\n")
    }

    /// Skills flagged `always` in frontmatter, filtered to available ones.
    pub fn get_always_skills(&self) -> Vec<String> {
        self.list_skills(true)
            .into_iter()
            .filter_map(|skill| {
                let meta = self.get_skill_metadata(&skill.name).unwrap_or_default();
                let always = meta
                    .get("always")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false)
                    || self
                        .skill_metadata_value(&skill.name)
                        .get("always")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                always.then_some(skill.name)
            })
            .collect()
    }

    pub fn get_skill_metadata(&self, name: &str) -> Option<HashMap<String, String>> {
        let content = self.load_skill(name)?;
        parse_frontmatter(&content)
    }

    fn skill_metadata_value(&self, name: &str) -> Value {
        let raw = self
            .get_skill_metadata(name)
            .and_then(|meta| meta.get("metadata").cloned())
            .unwrap_or_default();
        parse_skill_metadata(&raw)
    }

    fn requirements_met(&self, meta: &Value) -> bool {
        let Some(requires) = meta.get("requires").and_then(Value::as_object) else {
            return true;
        };
        if let Some(bins) = requires.get("bins").and_then(Value::as_array) {
            for bin in bins.iter().filter_map(Value::as_str) {
                if which::which(bin).is_err() {
                    return false;
                }
            }
        }
        if let Some(env_vars) = requires.get("env").and_then(Value::as_array) {
            for key in env_vars.iter().filter_map(Value::as_str) {
                if std::env::var(key).unwrap_or_default().is_empty() {
                    return false;
                }
            }
        }
        true
    }

    fn missing_requirements(&self, meta: &Value) -> String {
        let Some(requires) = meta.get("requires").and_then(Value::as_object) else {
            return String::new();
        };
        let mut missing = Vec::new();
        if let Some(bins) = requires.get("bins").and_then(Value::as_array) {
            for bin in bins.iter().filter_map(Value::as_str) {
                if which::which(bin).is_err() {
                    missing.push(format!("CLI: {bin}"));
                }
            }
        }
        if let Some(env_vars) = requires.get("env").and_then(Value::as_array) {
            for key in env_vars.iter().filter_map(Value::as_str) {
                if std::env::var(key).unwrap_or_default().is_empty() {
                    missing.push(format!("ENV: {key}"));
                }
            }
        }
        missing.join(", ")
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn parse_frontmatter(content: &str) -> Option<HashMap<String, String>> {
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some("---") {
        return None;
    }
    let mut out = HashMap::new();
    for line in lines {
        if line.trim() == "---" {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            out.insert(
                key.trim().to_string(),
                value
                    .trim()
                    .trim_matches('"')
                    .trim_matches('\'')
                    .to_string(),
            );
        }
    }
    Some(out)
}

fn strip_frontmatter(content: &str) -> String {
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some("---") {
        return content.to_string();
    }
    let mut in_frontmatter = true;
    let mut out = Vec::new();
    for line in lines {
        if in_frontmatter {
            if line.trim() == "---" {
                in_frontmatter = false;
            }
            continue;
        }
        out.push(line);
    }
    out.join("\n").trim().to_string()
}

fn parse_skill_metadata(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.get("nightowl").cloned().or(Some(v)))
        .unwrap_or_else(|| Value::Object(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_workspace_with_skill(name: &str, body: &str) -> PathBuf {
        let ws = std::env::temp_dir().join(format!("nightowl-skills-{}", Uuid::new_v4()));
        let dir = ws.join("skills").join(name);
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("SKILL.md"), body).expect("write");
        ws
    }

    #[test]
    fn lists_and_loads_workspace_skill() {
        let ws = temp_workspace_with_skill(
            "greeter",
            "---\ndescription: greets people\n---\nSay hello warmly.",
        );
        let loader = SkillsLoader::new(ws.clone(), Some(ws.join("nonexistent-builtin")));

        let skills = loader.list_skills(false);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "greeter");
        assert_eq!(skills[0].source, "workspace");

        let context = loader.load_skills_for_context(&["greeter".to_string()]);
        assert!(context.contains("Say hello warmly."));
        assert!(!context.contains("description:"));
    }

    #[test]
    fn summary_includes_description() {
        let ws = temp_workspace_with_skill(
            "notes",
            "---\ndescription: note taking\n---\nTake notes.",
        );
        let loader = SkillsLoader::new(ws.clone(), Some(ws.join("nonexistent-builtin")));
        let summary = loader.build_skills_summary();
        assert!(summary.contains("<name>notes</name>"));
        assert!(summary.contains("note taking"));
    }

    #[test]
    fn always_skill_is_detected() {
        let ws = temp_workspace_with_skill(
            "pinned",
            "---\ndescription: always on\nalways: true\n---\nBe pinned.",
        );
        let loader = SkillsLoader::new(ws.clone(), Some(ws.join("nonexistent-builtin")));
        assert_eq!(loader.get_always_skills(), vec!["pinned".to_string()]);
    }

    #[test]
    fn missing_requirement_filters_skill() {
        let ws = temp_workspace_with_skill(
            "gated",
            "---\ndescription: needs a binary\nmetadata: {\"requires\":{\"bins\":[\"nightowl-no-such-bin\"]}}\n---\nGated.",
        );
        let loader = SkillsLoader::new(ws.clone(), Some(ws.join("nonexistent-builtin")));
        assert!(loader.list_skills(true).is_empty());
        assert!(loader.build_skills_summary().contains("available=\"false\""));
    }
}
