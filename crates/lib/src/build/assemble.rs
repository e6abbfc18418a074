//! Build context assembly.

use std::sync::Arc;

use tracing::{debug, info};

use crate::build::archive;
use crate::build::recipe::RecipeSet;
use crate::build::staging::{StagingStore, context_key};
use crate::build::types::{AssembleError, BuildContextRef, BuildRequest};
use crate::consts::RECIPE_FILE_NAME;
use crate::source::{SourceError, SourceStore};
use crate::util::hash::{ContentHash, ContentHasher};

/// Compute the content hash of a build from its source and rendered recipe.
pub fn fingerprint(source: &[u8], recipe: &str) -> ContentHash {
  ContentHasher::new().part(source).part(recipe.as_bytes()).finish()
}

/// Turns build requests into published, content-addressed build contexts.
pub struct BuildContextAssembler {
  sources: Arc<dyn SourceStore>,
  staging: Arc<dyn StagingStore>,
  recipes: RecipeSet,
}

impl BuildContextAssembler {
  pub fn new(sources: Arc<dyn SourceStore>, staging: Arc<dyn StagingStore>, recipes: RecipeSet) -> Self {
    Self {
      sources,
      staging,
      recipes,
    }
  }

  pub fn recipes(&self) -> &RecipeSet {
    &self.recipes
  }

  /// Assemble and publish the build context for `request`.
  ///
  /// Assigns `request.content_hash` before publishing. When an archive for
  /// the same parser and hash is already staged, publishing is skipped and the
  /// returned reference has `reused` set.
  pub async fn assemble(&self, request: &mut BuildRequest) -> Result<BuildContextRef, AssembleError> {
    let source = self.sources.fetch(&request.parser_id).await.map_err(|e| match e {
      SourceError::NotFound(id) => AssembleError::SourceNotFound(id),
      SourceError::AccessDenied(id) => AssembleError::AccessDenied(id),
      SourceError::Unavailable(msg) => AssembleError::SourceUnavailable(msg),
    })?;

    let recipe = self
      .recipes
      .render(request)
      .map_err(AssembleError::RecipeGenerationFailed)?;

    let hash = fingerprint(&source, &recipe);
    request.content_hash = Some(hash.clone());

    let key = context_key(&request.parser_id, &hash);
    let uri = self.staging.locate(&key);

    if self.staging.exists(&key).await? {
      info!(parser = %request.parser_id, hash = %hash.image_tag(), "build context already staged");
      return Ok(BuildContextRef {
        third_party_id: request.third_party_id.clone(),
        parser_id: request.parser_id.clone(),
        runtime: request.runtime,
        content_hash: hash,
        key,
        uri,
        reused: true,
        size: 0,
      });
    }

    let source_file = self.recipes.template(request.runtime).source_file;
    let bytes = archive::pack(&[(source_file, source.as_slice()), (RECIPE_FILE_NAME, recipe.as_bytes())])?;
    let size = bytes.len() as u64;
    debug!(key = %key, size, "packaged build context");

    self.staging.put(&key, bytes).await?;

    info!(parser = %request.parser_id, hash = %hash.image_tag(), size, "build context published");
    Ok(BuildContextRef {
      third_party_id: request.third_party_id.clone(),
      parser_id: request.parser_id.clone(),
      runtime: request.runtime,
      content_hash: hash,
      key,
      uri,
      reused: false,
      size,
    })
  }
}
