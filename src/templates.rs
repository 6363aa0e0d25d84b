//! Server-rendered shell pages.
//!
//! Views live below `<static_root>/views`. The renderer is attached to every
//! request by the view stage so handlers further down the pipeline (and the
//! terminal not-found handler) can render pages that respect the sub path.

use std::path::Path;
use std::sync::Arc;

use axum::response::Html;
use tera::Tera;

use crate::config::TEMPLATE_GLOB;
use crate::error::{AppError, ServerError};

/// Tera-backed renderer shared by all requests.
#[derive(Clone)]
pub struct ViewRenderer {
    tera: Arc<Tera>,
    app_sub_url: String,
}

impl ViewRenderer {
    /// Loads every template under `views_dir`.
    ///
    /// A missing views directory is a startup error.
    pub fn load(views_dir: &Path, app_sub_url: &str) -> Result<Self, ServerError> {
        if !views_dir.is_dir() {
            return Err(ServerError::FileNotFound {
                what: "views directory",
                path: views_dir.to_path_buf(),
            });
        }

        let glob = views_dir.join(TEMPLATE_GLOB);
        let tera = Tera::new(&glob.to_string_lossy())?;
        tracing::debug!(
            templates = tera.get_template_names().count(),
            dir = %views_dir.display(),
            "Loaded views"
        );

        Ok(Self {
            tera: Arc::new(tera),
            app_sub_url: app_sub_url.to_string(),
        })
    }

    pub fn app_sub_url(&self) -> &str {
        &self.app_sub_url
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.tera.get_template_names().any(|t| t == name)
    }

    /// Renders `name` with `app_sub_url` (and the CSP nonce, when one was
    /// generated for this request) added to the context.
    pub fn render(
        &self,
        name: &str,
        context: &tera::Context,
        nonce: Option<&str>,
    ) -> Result<Html<String>, AppError> {
        let mut context = context.clone();
        context.insert("app_sub_url", &self.app_sub_url);
        if let Some(nonce) = nonce {
            context.insert("nonce", nonce);
        }
        Ok(Html(self.tera.render(name, &context)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_views_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ViewRenderer::load(&dir.path().join("views"), "").err().unwrap();
        assert!(matches!(err, ServerError::FileNotFound { .. }));
    }

    #[test]
    fn test_render_includes_sub_url_and_nonce() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("index.html"),
            "<base href=\"{{ app_sub_url | safe }}/\"><script nonce=\"{{ nonce }}\"></script>",
        )
        .unwrap();

        let renderer = ViewRenderer::load(dir.path(), "/portico").unwrap();
        assert!(renderer.has_template("index.html"));

        let html = renderer
            .render("index.html", &tera::Context::new(), Some("abc"))
            .unwrap();
        assert!(html.0.contains("/portico/"));
        assert!(html.0.contains("nonce=\"abc\""));
    }
}
