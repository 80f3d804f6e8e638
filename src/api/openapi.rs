use crate::error::{Error, Result};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::info;
use utoipa::openapi::{
    Contact, InfoBuilder, License, OpenApi, OpenApiBuilder, Tag, extensions::ExtensionsBuilder,
};
use utoipa_axum::router::OpenApiRouter;

pub const SDK_ID_EXTENSION: &str = "x-sdk-id";

/// One documented API surface of a service. Each becomes `<sdk_id>.json` under
/// `gen:openapi` and is merged into the HTTP router at startup.
pub struct Api {
    pub sdk_id: String,
    pub description: Option<String>,
    pub router: OpenApiRouter,
}

impl Api {
    /// Start an API whose routes are added with `.routes(routes!(...))` on
    /// [`Api::router`] so they are both served and documented.
    pub fn new(sdk_id: impl Into<String>) -> Self {
        Self {
            sdk_id: sdk_id.into(),
            description: None,
            router: OpenApiRouter::with_openapi(cargo_openapi()),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_router(mut self, router: OpenApiRouter) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Split into the servable router and its document, tagged with the sdk id.
    #[must_use]
    pub fn split(self) -> (axum::Router, OpenApi) {
        let Self {
            sdk_id,
            description,
            mut router,
        } = self;

        let mut tag = Tag::new(sdk_id.clone());
        tag.description = description;
        router.get_openapi_mut().tags = Some(vec![tag]);
        router.get_openapi_mut().extensions = Some(
            ExtensionsBuilder::new()
                .add(SDK_ID_EXTENSION, sdk_id)
                .build(),
        );

        router.split_for_parts()
    }
}

/// The `x-sdk-id` of a document, if any.
#[must_use]
pub fn sdk_id(openapi: &OpenApi) -> Option<String> {
    openapi
        .extensions
        .as_ref()
        .and_then(|extensions| extensions.get(SDK_ID_EXTENSION))
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

/// Documents keyed by sdk id.
///
/// # Errors
/// Returns a conflict when two APIs share an sdk id, or a validation error for an
/// empty one.
pub fn documents(apis: Vec<Api>) -> Result<BTreeMap<String, OpenApi>> {
    let mut documents = BTreeMap::new();
    for api in apis {
        let id = api.sdk_id.trim().to_string();
        if id.is_empty() {
            return Err(Error::validation("api sdk id must not be empty"));
        }
        if documents.contains_key(&id) {
            return Err(Error::conflict(format!("duplicate sdk id {id}")));
        }
        let (_router, openapi) = api.split();
        documents.insert(id, openapi);
    }
    Ok(documents)
}

/// Write each document to `dir/<sdk-id>.json`, creating `dir` when needed.
///
/// # Errors
/// Fails on duplicate sdk ids or any I/O error.
pub fn write_documents(dir: &Path, apis: Vec<Api>) -> Result<Vec<PathBuf>> {
    let documents = documents(apis)?;
    std::fs::create_dir_all(dir)?;

    let mut written = Vec::with_capacity(documents.len());
    for (id, openapi) in documents {
        let json = openapi
            .to_pretty_json()
            .map_err(|err| Error::validation(format!("{id}: cannot serialise openapi: {err}")))?;
        let path = dir.join(format!("{id}.json"));
        std::fs::write(&path, json)?;
        info!(path = %path.display(), "openapi document written");
        written.push(path);
    }
    Ok(written)
}

fn cargo_openapi() -> OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().map(str::trim)?;
    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    fn non_empty(value: &str) -> Option<&str> {
        Some(value.trim()).filter(|value| !value.is_empty())
    }

    match author.find('<') {
        Some(start) => (
            non_empty(&author[..start]),
            non_empty(author[start + 1..].trim_end_matches('>')),
        ),
        None => (non_empty(author), None),
    }
}
