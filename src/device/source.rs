//! Lightweight scan of kernel source for compute entry points.
//!
//! Recognises WGSL (`@compute ... fn name`) and Metal-style
//! (`kernel void name`) declarations. This is not a compiler: it only
//! finds names and rejects text that cannot be a kernel module at all.

use crate::dispatch::ThreadGroupSize;

/// Bind group reserved for the `GRID_SIZE` uniform.
pub const GRID_GROUP: u32 = 1;

/// A `var<storage>` declared in bind group 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageBinding {
    pub binding: u32,
    pub read_only: bool,
}

/// WGSL declarations prepended to every module.
///
/// `GROUP_SIZE_X/Y/Z` size `@workgroup_size`. `GRID_SIZE` holds the
/// dispatched grid; the launch is rounded up to whole groups, so kernels
/// guard with `all(id < GRID_SIZE)`.
pub fn wgsl_prelude(group: ThreadGroupSize) -> String {
    format!(
        "const GROUP_SIZE_X: u32 = {}u;\n\
         const GROUP_SIZE_Y: u32 = {}u;\n\
         const GROUP_SIZE_Z: u32 = {}u;\n\
         @group({}) @binding(0) var<uniform> GRID_SIZE: vec3<u32>;\n",
        group.x, group.y, group.z, GRID_GROUP
    )
}

/// Storage buffers a WGSL module declares in bind group 0, by binding.
pub fn storage_bindings(source: &str) -> Result<Vec<StorageBinding>, String> {
    let stripped = strip_comments(source);
    let tokens = tokenize(&stripped);
    let mut found: Vec<StorageBinding> = Vec::new();
    let mut group = None;
    let mut binding = None;

    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "@" => {
                let attr = tokens.get(i + 1).copied();
                let value = match tokens.get(i + 2..i + 5) {
                    Some(["(", n, ")"]) => parse_index(n),
                    _ => None,
                };
                match attr {
                    Some("group") => group = value,
                    Some("binding") => binding = value,
                    _ => {}
                }
                i += 1;
            }
            "var" => {
                let mut space = Vec::new();
                if tokens.get(i + 1) == Some(&"<") {
                    let mut j = i + 2;
                    while let Some(&t) = tokens.get(j) {
                        j += 1;
                        if t == ">" {
                            break;
                        }
                        if t != "," {
                            space.push(t);
                        }
                    }
                    i = j - 1;
                }

                if space.first() == Some(&"storage") && group == Some(0) {
                    let binding = binding
                        .ok_or_else(|| "storage variable without @binding".to_string())?;
                    if found.iter().any(|b| b.binding == binding) {
                        return Err(format!("binding {} declared twice in group 0", binding));
                    }
                    found.push(StorageBinding {
                        binding,
                        read_only: space.get(1).map_or(true, |&a| a == "read"),
                    });
                }
                group = None;
                binding = None;
            }
            ";" | "fn" => {
                group = None;
                binding = None;
            }
            _ => {}
        }
        i += 1;
    }

    found.sort_by_key(|b| b.binding);
    Ok(found)
}

fn parse_index(token: &str) -> Option<u32> {
    token.trim_end_matches(['u', 'i']).parse().ok()
}

/// Entry points declared in a module, in source order.
pub fn entry_points(source: &str) -> Result<Vec<String>, String> {
    let stripped = strip_comments(source);
    check_balanced(&stripped)?;

    let tokens = tokenize(&stripped);
    let mut found = Vec::new();
    let mut compute_attr = false;

    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "@" if tokens.get(i + 1) == Some(&"compute") => {
                compute_attr = true;
                i += 1;
            }
            "fn" => {
                if let Some(name) = tokens.get(i + 1).filter(|t| is_ident(t)) {
                    if compute_attr {
                        found.push(name.to_string());
                    }
                }
                compute_attr = false;
            }
            "kernel" if tokens.get(i + 1) == Some(&"void") => {
                if let Some(name) = tokens.get(i + 2).filter(|t| is_ident(t)) {
                    found.push(name.to_string());
                }
                i += 2;
            }
            _ => {}
        }
        i += 1;
    }

    if found.is_empty() {
        return Err("no compute entry points found in kernel source".to_string());
    }

    Ok(found)
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }

    out
}

fn check_balanced(source: &str) -> Result<(), String> {
    let mut stack = Vec::new();

    for (line, text) in source.lines().enumerate() {
        for c in text.chars() {
            match c {
                '{' | '(' | '[' => stack.push(c),
                '}' | ')' | ']' => {
                    let open = match c {
                        '}' => '{',
                        ')' => '(',
                        _ => '[',
                    };
                    if stack.pop() != Some(open) {
                        return Err(format!("unexpected '{}' on line {}", c, line + 1));
                    }
                }
                _ => {}
            }
        }
    }

    match stack.last() {
        Some(open) => Err(format!("unclosed '{}' at end of kernel source", open)),
        None => Ok(()),
    }
}

fn tokenize(source: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;

    for (i, c) in source.char_indices() {
        if c.is_alphanumeric() || c == '_' {
            start.get_or_insert(i);
            continue;
        }
        if let Some(s) = start.take() {
            tokens.push(&source[s..i]);
        }
        if !c.is_whitespace() {
            tokens.push(&source[i..i + c.len_utf8()]);
        }
    }
    if let Some(s) = start {
        tokens.push(&source[s..]);
    }

    tokens
}

fn is_ident(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}
