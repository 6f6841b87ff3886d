//! Reescritura de imágenes incrustadas en contenido enriquecido.
//!
//! Un `<img data-store="gallery" data-offset="2" ...>` apunta a la tercera
//! referencia del atributo `gallery`. Al leer el contenido se sustituye por
//! una etiqueta con la URL que devuelve el renderizador de imágenes.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;
use url::Url;

/// Colaborador que produce la URL de una imagen almacenada.
pub trait ImageRenderer {
    fn render(&self, reference: &str, size: Option<(u32, u32)>) -> String;
}

/// Renderizador mínimo: une la referencia a una URL base y pide el tamaño
/// por query string.
#[derive(Debug, Clone)]
pub struct UrlImageRenderer {
    base: Url,
}

impl UrlImageRenderer {
    pub fn new(base: &str) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }
}

impl ImageRenderer for UrlImageRenderer {
    fn render(&self, reference: &str, size: Option<(u32, u32)>) -> String {
        let Ok(mut url) = self.base.join(reference.trim_start_matches('/')) else {
            return format!("{}{}", self.base, reference);
        };
        if let Some((width, height)) = size {
            url.query_pairs_mut()
                .append_pair("w", &width.to_string())
                .append_pair("h", &height.to_string());
        }
        url.to_string()
    }
}

fn img_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<img([^>]+)>").expect("regex válida"))
}

fn tag_attribute() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([a-z-]+)="([^"]+)""#).expect("regex válida"))
}

fn style_rule() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*(\w+)\s*:\s*(\w+)\s*;?").expect("regex válida"))
}

/// Sustituye las imágenes con `data-store`/`data-offset` del contenido.
///
/// `lookup(atributo, índice)` devuelve la referencia almacenada. Las etiquetas
/// sin esos marcadores, o cuya referencia no existe, se dejan intactas.
pub fn expand_images<F>(content: &str, lookup: F, renderer: &dyn ImageRenderer) -> String
where
    F: Fn(&str, usize) -> Option<String>,
{
    img_tag()
        .replace_all(content, |caps: &Captures| {
            rewrite_tag(&caps[1], &lookup, renderer).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn rewrite_tag<F>(inner: &str, lookup: &F, renderer: &dyn ImageRenderer) -> Option<String>
where
    F: Fn(&str, usize) -> Option<String>,
{
    let attrs: HashMap<&str, &str> = tag_attribute()
        .captures_iter(inner)
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .collect();

    let store = attrs.get("data-store")?;
    let offset: usize = attrs.get("data-offset")?.parse().ok()?;
    let reference = lookup(store, offset)?;

    let mut width = attrs.get("width").map(|w| w.to_string());
    let mut height = attrs.get("height").map(|h| h.to_string());
    if width.is_none() || height.is_none() {
        if let Some(style) = attrs.get("style") {
            for rule in style_rule().captures_iter(style) {
                match &rule[1] {
                    "width" => width = Some(rule[2].to_string()),
                    "height" => height = Some(rule[2].to_string()),
                    _ => {}
                }
            }
        }
    }

    let size = match (width.as_deref().and_then(pixels), height.as_deref().and_then(pixels)) {
        (Some(w), Some(h)) => Some((w, h)),
        _ => None,
    };
    Some(format!("<img src=\"{}\" alt=\"\" />", renderer.render(&reference, size)))
}

fn pixels(raw: &str) -> Option<u32> {
    raw.trim().trim_end_matches("px").parse().ok()
}
