//! Menu rendering and selection resolution.

use crate::model::{MenuOption, Queue};

/// Render the numbered queue menu, optionally headed by the channel
/// greeting.
pub fn render_queue_menu(header: Option<&str>, queues: &[Queue]) -> String {
    let mut out = String::new();
    if let Some(header) = header
        && !header.trim().is_empty()
    {
        out.push_str(header.trim());
        out.push_str("\n\n");
    }
    for (index, queue) in queues.iter().enumerate() {
        out.push_str(&format!("[{}] {}\n", index + 1, queue.name));
    }
    out.trim_end().to_string()
}

/// Render a queue's own option list (the sub-menu).
pub fn render_submenu(queue: &Queue) -> String {
    let mut out = String::new();
    if let Some(greeting) = queue.greeting_message.as_deref()
        && !greeting.trim().is_empty()
    {
        out.push_str(greeting.trim());
        out.push_str("\n\n");
    }
    for (index, option) in queue.menu_options.iter().enumerate() {
        out.push_str(&format!("[{}] {}\n", index + 1, option.title));
    }
    out.trim_end().to_string()
}

/// Resolve a menu reply to a queue.
///
/// Name search wins: case-insensitive exact match first, then substring
/// containment when it is unambiguous. Only when the name search fails
/// does a numeric selection fall back to a 1-based index, and only when
/// it is in range. Anything else resolves to nothing.
pub fn resolve_queue_selection<'a>(queues: &'a [Queue], selection: &str) -> Option<&'a Queue> {
    let needle = selection.trim();
    if needle.is_empty() {
        return None;
    }
    let lower = needle.to_lowercase();

    if let Some(queue) = queues.iter().find(|q| q.name.to_lowercase() == lower) {
        return Some(queue);
    }

    let mut contains = queues
        .iter()
        .filter(|q| q.name.to_lowercase().contains(&lower));
    if let (Some(first), None) = (contains.next(), contains.next()) {
        return Some(first);
    }

    if let Ok(ordinal) = needle.parse::<usize>()
        && ordinal >= 1
        && ordinal <= queues.len()
    {
        return Some(&queues[ordinal - 1]);
    }

    None
}

/// Resolve a sub-menu reply to an option, same rules as queue selection.
pub fn resolve_menu_option<'a>(options: &'a [MenuOption], selection: &str) -> Option<&'a MenuOption> {
    let needle = selection.trim();
    if needle.is_empty() {
        return None;
    }
    let lower = needle.to_lowercase();

    if let Some(option) = options.iter().find(|o| o.title.to_lowercase() == lower) {
        return Some(option);
    }

    let mut contains = options
        .iter()
        .filter(|o| o.title.to_lowercase().contains(&lower));
    if let (Some(first), None) = (contains.next(), contains.next()) {
        return Some(first);
    }

    if let Ok(ordinal) = needle.parse::<usize>()
        && ordinal >= 1
        && ordinal <= options.len()
    {
        return Some(&options[ordinal - 1]);
    }

    None
}
