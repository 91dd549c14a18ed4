use std::{cell::Cell, rc::Rc};

use lol_html::{RewriteStrSettings, element, rewrite_str};

use crate::application::render::types::RenderError;

/// Stamp each task-list checkbox with its position among all task items.
pub(crate) fn index_task_items(html: &str) -> Result<String, RenderError> {
    if !html.contains("task-list-item-checkbox") {
        return Ok(html.to_string());
    }

    let next_index = Rc::new(Cell::new(0usize));

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("input.task-list-item-checkbox", {
                let next_index = Rc::clone(&next_index);
                move |el| {
                    let index = next_index.get();
                    next_index.set(index.saturating_add(1));
                    el.set_attribute("data-task-index", &index.to_string())?;
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| RenderError::Document {
        message: err.to_string(),
    })
}
