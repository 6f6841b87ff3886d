use std::collections::HashMap;
use std::fs;

use elastic_model::{
    AttributeValue, ElasticAttributeStore, ElasticConfig, ElasticError, NoUploads, RecordHost, SaveOutcome,
    TempUploadArea, TemplateSource,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Default)]
struct Article {
    scenario: String,
    new: bool,
    columns: HashMap<String, String>,
    errors: Vec<(String, String)>,
}

impl RecordHost for Article {
    fn scenario(&self) -> &str {
        &self.scenario
    }
    fn is_new_record(&self) -> bool {
        self.new
    }
    fn column(&self, name: &str) -> Option<String> {
        self.columns.get(name).cloned()
    }
    fn set_column(&mut self, name: &str, value: String) {
        self.columns.insert(name.to_string(), value);
    }
    fn add_error(&mut self, attribute: &str, message: &str) {
        self.errors.push((attribute.to_string(), message.to_string()));
    }
}

fn article_store(web_root: &std::path::Path) -> ElasticAttributeStore {
    let config = ElasticConfig {
        web_root: web_root.to_path_buf(),
        path_parameters: vec![("{id}".into(), "id".into())],
        ..ElasticConfig::default()
    };
    let template = json!({
        "title": {"model": {"rules": [["required"], ["length", {"max": 40}]]}},
        "separator": {"model": null},
        "summary": {"model": {"rules": [["safe"]]}},
        "photo": {
            "model": {"rules": [["file", {"types": "jpg png"}]], "targetPathAlias": "files/{id}", "targetUrl": "/files/{id}"},
            "element": {"type": "asyncfile"}
        },
        "gallery": {
            "model": {"targetPathAlias": "files/{id}/gallery", "targetUrl": "files/{id}/gallery"},
            "element": {"type": "asyncfile", "config": {"multiSelection": true}}
        }
    });
    let mut store = ElasticAttributeStore::new(&config, TemplateSource::Literal(template));
    assert_ok!(store.configure());
    store
}

#[test]
fn new_record_places_uploads_after_the_first_insert() {
    let web = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let area = TempUploadArea::new(staging.path());
    let staged = area.store("sess", "form", "Cover.JPG", b"jpeg-bytes").unwrap();

    let mut store = article_store(web.path());
    let mut article = Article {
        scenario: "insert".into(),
        new: true,
        ..Article::default()
    };
    store.set_attributes(vec![
        ("title".to_string(), AttributeValue::from("Hola")),
        ("photo".to_string(), AttributeValue::from(staged.reference())),
    ]);

    let uploads = area.upload_source("sess", "form");
    assert!(store.before_validate(&mut article, &uploads));
    assert!(article.errors.is_empty(), "{:?}", article.errors);

    assert_ok!(store.before_save(&mut article, &uploads));
    assert!(article.column("elastic_storage").unwrap().contains("tmp://cover.jpg"));

    // el anfitrión inserta y obtiene su clave primaria
    article.set_column("id", "12".into());
    article.new = false;

    let outcome = store.after_save(&mut article, &uploads).unwrap();
    assert_eq!(outcome, SaveOutcome::ResaveRequired);
    assert_eq!(store.get_attribute("photo"), Some(&AttributeValue::from("files/12/cover.jpg")));
    assert!(article.column("elastic_storage").unwrap().contains("files/12/cover.jpg"));
    assert_eq!(fs::read(web.path().join("files/12/cover.jpg")).unwrap(), b"jpeg-bytes");
    assert!(area.list("sess", "form").unwrap().is_empty());
}

#[test]
fn replacing_a_stored_file_with_a_same_named_upload() {
    let web = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let stored = web.path().join("files/3");
    fs::create_dir_all(&stored).unwrap();
    fs::write(stored.join("a.jpg"), b"old").unwrap();

    let mut article = Article {
        scenario: "update".into(),
        ..Article::default()
    };
    article.set_column("id", "3".into());
    article.set_column("elastic_storage", r#"{"title":"T","photo":"files/3/a.jpg"}"#.into());

    let mut store = article_store(web.path());
    assert_ok!(store.after_find(&article));

    let area = TempUploadArea::new(staging.path());
    let staged = area.store("sess", "3", "a.jpg", b"new").unwrap();
    store.set_attribute("photo", staged.reference());

    let uploads = area.upload_source("sess", "3");
    assert_ok!(store.before_save(&mut article, &uploads));

    let photo = store.get_attribute("photo").and_then(AttributeValue::as_text).unwrap().to_string();
    assert!(photo.starts_with("files/3/a-") && photo.ends_with(".jpg"), "{photo}");
    // el fichero anterior sigue ahí hasta confirmar el guardado
    assert_eq!(fs::read(stored.join("a.jpg")).unwrap(), b"old");

    assert_eq!(store.after_save(&mut article, &NoUploads).unwrap(), SaveOutcome::Saved);
    assert!(!stored.join("a.jpg").exists());
    let placed = photo.strip_prefix("files/3/").unwrap();
    assert_eq!(fs::read(stored.join(placed)).unwrap(), b"new");
}

#[test]
fn serialized_blob_round_trips_through_load() {
    let web = TempDir::new().unwrap();
    let mut store = article_store(web.path());
    store.set_attribute("title", "Crónica");
    store.set_attribute("gallery", vec!["files/1/gallery/x.png", "files/1/gallery/y.png"]);
    assert!(!store.set_attribute("unknown", "dropped"));

    let blob = store.serialize().unwrap();
    assert!(!blob.contains("separator"));
    let keys: Vec<String> = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&blob)
        .unwrap()
        .keys()
        .cloned()
        .collect();
    assert_eq!(keys, vec!["title", "summary", "photo", "gallery"]);

    let mut reloaded = article_store(web.path());
    reloaded.load(&blob).unwrap();
    assert_eq!(reloaded.attributes(), store.attributes());
}

#[test]
fn ambiguous_single_file_aborts_the_save_without_writing() {
    let web = TempDir::new().unwrap();
    let mut article = Article::default();
    article.set_column("id", "4".into());
    article.set_column("elastic_storage", r#"{"photo":"files/4/a.jpg"}"#.into());

    let mut store = article_store(web.path());
    assert_ok!(store.after_find(&article));
    store.set_attribute("photo", vec!["files/4/a.jpg", "b.jpg"]);

    let err = assert_err!(store.before_save(&mut article, &NoUploads));
    assert!(matches!(err, ElasticError::AmbiguousSingleValue { count: 2, .. }));
    assert!(article.column("elastic_storage").unwrap().contains(r#""photo":"files/4/a.jpg""#));
}

#[test]
fn validation_errors_reach_the_host_without_blocking() {
    let web = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let area = TempUploadArea::new(staging.path());
    let staged = area.store("s", "f", "virus.exe", b"MZ").unwrap();

    let mut store = article_store(web.path());
    store.set_attribute("photo", staged.reference());
    let mut article = Article {
        scenario: "insert".into(),
        ..Article::default()
    };

    assert!(store.before_validate(&mut article, &area.upload_source("s", "f")));
    let attributes: Vec<&str> = article.errors.iter().map(|(a, _)| a.as_str()).collect();
    assert_eq!(attributes, vec!["photo", "title"]);
}

#[test]
fn submitted_references_stay_inside_the_target_directory() {
    let root = TempDir::new().unwrap();
    let web = root.path().join("web");
    fs::create_dir_all(&web).unwrap();
    let victim = root.path().join("victim.txt");
    fs::write(&victim, b"keep").unwrap();

    let mut article = Article {
        scenario: "update".into(),
        ..Article::default()
    };
    article.set_column("id", "5".into());
    article.set_column("elastic_storage", r#"{"title":"T"}"#.into());

    let mut store = article_store(&web);
    assert_ok!(store.after_find(&article));
    store.set_attribute("gallery", vec!["../../../../victim.txt"]);

    assert_ok!(store.before_save(&mut article, &NoUploads));
    assert!(!article.column("elastic_storage").unwrap().contains("victim"));
    assert_eq!(store.after_save(&mut article, &NoUploads).unwrap(), SaveOutcome::Saved);

    assert_eq!(store.after_delete(&article).unwrap(), 0);
    assert_eq!(fs::read(&victim).unwrap(), b"keep");
}

#[test]
fn failed_save_keeps_staged_uploads_for_a_retry() {
    let web = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let area = TempUploadArea::new(staging.path());
    let cover = area.store("sess", "6", "cover.jpg", b"cover").unwrap();
    let shot = area.store("sess", "6", "shot.png", b"shot").unwrap();

    // un fichero donde debería ir la carpeta de la galería
    let record_dir = web.path().join("files/6");
    fs::create_dir_all(&record_dir).unwrap();
    fs::write(record_dir.join("gallery"), b"").unwrap();

    let mut article = Article {
        scenario: "update".into(),
        ..Article::default()
    };
    article.set_column("id", "6".into());
    article.set_column("elastic_storage", r#"{"title":"T"}"#.into());

    let mut store = article_store(web.path());
    assert_ok!(store.after_find(&article));
    store.set_attribute("photo", cover.reference());
    store.set_attribute("gallery", vec![shot.reference()]);

    let uploads = area.upload_source("sess", "6");
    assert_err!(store.before_save(&mut article, &uploads));
    assert!(!record_dir.join("cover.jpg").exists());
    assert_eq!(area.list("sess", "6").unwrap().len(), 2);
    assert_eq!(store.get_attribute("photo"), Some(&AttributeValue::from(cover.reference())));

    fs::remove_file(record_dir.join("gallery")).unwrap();
    assert_ok!(store.before_save(&mut article, &uploads));
    assert_eq!(store.after_save(&mut article, &NoUploads).unwrap(), SaveOutcome::Saved);
    assert_eq!(fs::read(record_dir.join("cover.jpg")).unwrap(), b"cover");
    assert_eq!(fs::read(record_dir.join("gallery/shot.png")).unwrap(), b"shot");
    assert!(area.list("sess", "6").unwrap().is_empty());
}
