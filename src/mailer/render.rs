//! Template rendering.
//!
//! Layout: `templates/<name>.html|.txt` and `layouts/<layout>.html|.txt` inside the
//! mail filesystem. The main template renders first; the layout then renders with the
//! same data plus `content`, the already rendered main body. HTML templates are
//! auto-escaped, text templates are not.

use crate::{
    error::{Error, Result},
    fs::SharedFs,
    i18n::Localizer,
};
use minijinja::{
    Environment, Value, context,
    value::{Rest, ValueKind},
};
use serde::Serialize;
use std::collections::BTreeMap;

pub const TEMPLATES_DIR: &str = "templates";
pub const LAYOUTS_DIR: &str = "layouts";

/// Template functions by name, built with [`Value::from_function`].
pub type FuncMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub layout: Option<String>,
    pub localizer: Option<Localizer>,
    pub funcs: Vec<FuncMap>,
}

impl RenderOptions {
    #[must_use]
    pub fn with_layout(mut self, layout: impl Into<String>) -> Self {
        self.layout = Some(layout.into());
        self
    }

    #[must_use]
    pub fn with_localizer(mut self, localizer: Localizer) -> Self {
        self.localizer = Some(localizer);
        self
    }

    #[must_use]
    pub fn with_funcs(mut self, funcs: FuncMap) -> Self {
        self.funcs.push(funcs);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Rendered {
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    fs: SharedFs,
    default_layout: String,
    funcs: Vec<FuncMap>,
}

impl Renderer {
    pub fn new(fs: SharedFs, default_layout: impl Into<String>) -> Self {
        Self {
            fs,
            default_layout: default_layout.into(),
            funcs: Vec::new(),
        }
    }

    /// Mailer-wide extra functions, applied before per-render ones.
    #[must_use]
    pub fn with_funcs(mut self, funcs: FuncMap) -> Self {
        self.funcs.push(funcs);
        self
    }

    /// Names of every `templates/*.html`, sorted.
    pub fn templates(&self) -> Result<Vec<String>> {
        Ok(self
            .fs
            .list_dir(TEMPLATES_DIR)?
            .into_iter()
            .filter_map(|name| name.strip_suffix(".html").map(str::to_string))
            .collect())
    }

    #[must_use]
    pub fn has_template(&self, template: &str) -> bool {
        self.fs.exists(&format!("{TEMPLATES_DIR}/{template}.html"))
    }

    /// Optional preview data stored next to a template as `<name>.json`.
    pub fn sample_data(&self, template: &str) -> Result<serde_json::Value> {
        let path = format!("{TEMPLATES_DIR}/{template}.json");
        if !self.fs.exists(&path) {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        let raw = self.fs.read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map_err(|err| Error::validation(format!("invalid sample data {path}: {err}")))
    }

    /// Render HTML and plain text. A missing `.txt` yields empty text.
    pub fn render<D: Serialize>(
        &self,
        template: &str,
        data: &D,
        options: &RenderOptions,
    ) -> Result<Rendered> {
        if template.is_empty() || template.contains("..") {
            return Err(Error::validation(format!("invalid template name: {template}")));
        }
        let env = self.environment(options);
        let layout = options.layout.as_deref().unwrap_or(&self.default_layout);
        let data = Value::from_serialize(data);

        let html = compose(&env, &format!("{TEMPLATES_DIR}/{template}.html"), layout, "html", &data)?
            .ok_or_else(|| Error::not_found(format!("mail template {template}")))?;
        let text = compose(&env, &format!("{TEMPLATES_DIR}/{template}.txt"), layout, "txt", &data)?
            .unwrap_or_default();

        Ok(Rendered { html, text })
    }

    fn environment(&self, options: &RenderOptions) -> Environment<'static> {
        let mut env = Environment::new();
        let fs = self.fs.clone();
        env.set_loader(move |name| match fs.read_to_string(name) {
            Ok(source) => Ok(Some(source)),
            Err(err) if err.kind() == crate::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                err.to_string(),
            )),
        });

        let mut funcs = FuncMap::new();
        funcs.insert("t".to_string(), translate_fn(options.localizer.clone()));
        for extra in self.funcs.iter().chain(options.funcs.iter()) {
            for (name, func) in extra {
                funcs.insert(name.clone(), func.clone());
            }
        }
        for (name, func) in funcs {
            env.add_global(name, func);
        }
        env
    }
}

/// Render `main`, then wrap it in `layouts/<layout>.<ext>` when that exists.
/// `None` when the main template does not exist.
fn compose(
    env: &Environment<'_>,
    main: &str,
    layout: &str,
    ext: &str,
    data: &Value,
) -> Result<Option<String>> {
    let template = match env.get_template(main) {
        Ok(template) => template,
        Err(err) if err.kind() == minijinja::ErrorKind::TemplateNotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let body = template.render(data)?;

    let layout_name = format!("{LAYOUTS_DIR}/{layout}.{ext}");
    match env.get_template(&layout_name) {
        Ok(layout) => {
            let content = if ext == "html" {
                Value::from_safe_string(body)
            } else {
                Value::from(body)
            };
            let ctx = context! { content => content, ..data.clone() };
            Ok(Some(layout.render(ctx)?))
        }
        Err(err) if err.kind() == minijinja::ErrorKind::TemplateNotFound => Ok(Some(body)),
        Err(err) => Err(err.into()),
    }
}

/// `t(id)`, `t(id, {..})` or `t(id, "k1", v1, "k2", v2)`.
fn translate_fn(localizer: Option<Localizer>) -> Value {
    Value::from_function(
        move |id: String, rest: Rest<Value>| -> std::result::Result<String, minijinja::Error> {
            let data = translation_data(&rest)?;
            Ok(match &localizer {
                Some(localizer) => localizer.t(&id, &data),
                None => id,
            })
        },
    )
}

fn translation_data(args: &[Value]) -> std::result::Result<Value, minijinja::Error> {
    match args {
        [] => Ok(Value::from(BTreeMap::<String, Value>::new())),
        [single] if single.kind() == ValueKind::Map => Ok(single.clone()),
        pairs if pairs.len() % 2 == 0 => {
            let mut map = BTreeMap::new();
            for pair in pairs.chunks(2) {
                let key = pair[0].as_str().ok_or_else(|| {
                    minijinja::Error::new(
                        minijinja::ErrorKind::InvalidOperation,
                        "t: keys must be strings",
                    )
                })?;
                map.insert(key.to_string(), pair[1].clone());
            }
            Ok(Value::from(map))
        }
        _ => Err(minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            "t: expected a map or key/value pairs",
        )),
    }
}
