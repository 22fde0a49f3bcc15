//! Virtual field materialization.

use std::sync::Arc;
use tracing::trace;

use crate::{
    document::Document,
    error::{ModelError, ModelResult},
};

/// Computes the named virtuals on every document and stores the results as own values.
///
/// `names` must already be in dependency order, which is what the resolver produces. A
/// virtual that already has an own value is left alone; a getter yielding no value leaves the
/// field absent. Cached virtuals are pinned once materialized.
pub fn materialize_virtuals(documents: &mut [Document], names: &[String]) -> ModelResult<()> {
    if names.is_empty() {
        return Ok(());
    }

    for document in documents.iter_mut() {
        let schema = Arc::clone(document.schema());

        for name in names {
            let definition = schema.virtual_field(name).ok_or_else(|| {
                ModelError::configuration(format!(
                    "unknown virtual `{name}` on model `{}`",
                    schema.name()
                ))
            })?;

            if document.has_own(name) {
                continue;
            }

            let Some(value) = definition.compute(document) else {
                trace!(model = schema.name(), %name, "virtual produced no value");
                continue;
            };

            document.data_mut().insert(name.clone(), value);

            if definition.cache {
                document.pin(name);
            }
        }
    }

    Ok(())
}
