//! Static client bundle

use std::path::{Component, Path, PathBuf};

use actix_web::http::Method;
use actix_web::http::header;
use actix_web::web::Data;
use actix_web::{HttpRequest, HttpResponse};
use tracing::warn;

/// Directory the client bundle is served from
#[derive(Debug, Clone)]
pub struct Assets {
    root: PathBuf,
}

impl Assets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps the request path into the bundle, `None` for paths escaping the root
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();

        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }

        Some(resolved)
    }

    fn index(&self) -> PathBuf {
        self.root.join("index.html")
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json" | "map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn read(path: &Path) -> Option<Vec<u8>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return None,
    }

    match tokio::fs::read(path).await {
        Ok(content) => Some(content),
        Err(err) => {
            warn!(%err, path = %path.display(), "Cannot read asset");
            None
        }
    }
}

/// Serves files of the bundle, unknown paths get `index.html` so client side routes work
pub async fn serve(req: HttpRequest, assets: Option<Data<Assets>>) -> HttpResponse {
    let Some(assets) = assets else {
        return HttpResponse::NotFound().finish();
    };

    if req.method() != Method::GET && req.method() != Method::HEAD {
        return HttpResponse::NotFound().finish();
    }

    let Some(path) = assets.resolve(req.path()) else {
        return HttpResponse::NotFound().finish();
    };

    if let Some(content) = read(&path).await {
        return HttpResponse::Ok()
            .insert_header((header::CONTENT_TYPE, content_type(&path)))
            .body(content);
    }

    let index = assets.index();
    match read(&index).await {
        Some(content) => HttpResponse::Ok()
            .insert_header((header::CONTENT_TYPE, content_type(&index)))
            .body(content),
        None => HttpResponse::NotFound().finish(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_stays_in_root() {
        let assets = Assets::new("/srv/dist");

        assert_eq!(
            assets.resolve("/assets/app.js"),
            Some(PathBuf::from("/srv/dist/assets/app.js"))
        );
        assert_eq!(assets.resolve("/"), Some(PathBuf::from("/srv/dist")));
        assert_eq!(assets.resolve("/../etc/passwd"), None);
        assert_eq!(assets.resolve("/assets/../../secret"), None);
    }

    #[test]
    fn content_types() {
        assert_eq!(
            content_type(Path::new("index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            content_type(Path::new("assets/app.JS")),
            "application/octet-stream"
        );
        assert_eq!(content_type(Path::new("blob")), "application/octet-stream");
    }
}
