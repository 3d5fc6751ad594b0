use anyhow::{Error, Result, anyhow};
use serde_json::{Map, Value};
use tera::Tera;
use tracing::info;

use crate::error::ProcessError;

/// HTML templates loaded from a directory, one `{name}.html` per template.
pub struct TemplateStore {
    tera: Tera,
}

impl TemplateStore {
    pub fn load(template_dir: &str) -> Result<Self, Error> {
        let glob = format!("{}/**/*.html", template_dir.trim_end_matches('/'));
        let tera =
            Tera::new(&glob).map_err(|e| anyhow!("Failed to load templates from {glob}: {e}"))?;

        info!(
            dir = template_dir,
            templates = tera.get_template_names().count(),
            "Template store loaded"
        );

        Ok(Self { tera })
    }

    pub fn render(
        &self,
        name: &str,
        context: &Map<String, Value>,
    ) -> Result<String, ProcessError> {
        let file = format!("{name}.html");

        if !self.tera.get_template_names().any(|t| t == file) {
            return Err(ProcessError::TemplateNotFound(name.to_string()));
        }

        let context = tera::Context::from_serialize(Value::Object(context.clone()))
            .map_err(ProcessError::TemplateRender)?;

        self.tera
            .render(&file, &context)
            .map_err(ProcessError::TemplateRender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with(name: &str, body: &str) -> (tempfile::TempDir, TemplateStore) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{name}.html")), body).unwrap();
        let store = TemplateStore::load(dir.path().to_str().unwrap()).unwrap();
        (dir, store)
    }

    /// Test: a present template renders with its context
    #[test]
    fn renders_existing_template() {
        let (_dir, store) = store_with("welcome", "<p>Hello {{ name }}</p>");

        let mut context = Map::new();
        context.insert("name".to_string(), json!("Ada"));

        assert_eq!(store.render("welcome", &context).unwrap(), "<p>Hello Ada</p>");
    }

    /// Test: a missing template is the template-not-found condition
    #[test]
    fn missing_template_is_not_found() {
        let (_dir, store) = store_with("welcome", "<p>hi</p>");

        let err = store.render("goodbye", &Map::new()).unwrap_err();
        assert!(matches!(err, ProcessError::TemplateNotFound(_)));
        assert!(err.requeue());
    }
}
