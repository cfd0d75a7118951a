use std::sync::Arc;

use anyhow::{Context, Result};
use headless_chrome::Tab;

use crate::types::{MAX_LABEL_CHARS, RawElement, ScrollDirection};

/// Attribute the extraction script stamps on every candidate so the
/// element can be found again when an action targets it.
pub const REF_ATTR: &str = "data-pp-ref";

/// JavaScript injected into the page to list interactable elements.
/// NON-DESTRUCTIVE apart from the `data-pp-ref` stamp.
///
/// The script:
///   1. Collects links, buttons and text inputs (native or ARIA-role based).
///   2. Maps each to one of `link`, `button`, `textbox`; skips everything else.
///   3. Records viewport geometry and whether the element is actually showing.
///   4. Returns the list as a JSON string, in document order.
const ELEMENTS_JS: &str = r#"
(() => {
  const MAX_LABEL = __MAX_LABEL__;
  const SELECTOR = 'a[href], button, input, textarea, [role="button"], [role="link"], [role="searchbox"], [role="textbox"], [contenteditable="true"]';
  const TEXT_INPUTS = new Set(['', 'text', 'search', 'email', 'tel', 'url', 'number']);
  const BUTTON_INPUTS = new Set(['submit', 'button', 'image', 'reset']);

  function roleOf(el) {
    const aria = (el.getAttribute('role') || '').toLowerCase();
    if (aria === 'searchbox' || aria === 'textbox' || el.isContentEditable) return 'textbox';
    if (aria === 'button') return 'button';
    if (aria === 'link') return 'link';
    const tag = el.tagName.toLowerCase();
    if (tag === 'a') return 'link';
    if (tag === 'button') return 'button';
    if (tag === 'textarea') return 'textbox';
    if (tag === 'input') {
      const type = (el.getAttribute('type') || '').toLowerCase();
      if (TEXT_INPUTS.has(type)) return 'textbox';
      if (BUTTON_INPUTS.has(type)) return 'button';
    }
    return null;
  }

  function isVisible(el, r) {
    if (r.width === 0 || r.height === 0) return false;
    if (r.bottom < 0 || r.top > window.innerHeight || r.right < 0 || r.left > window.innerWidth) return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function labelOf(el) {
    const img = el.querySelector && el.querySelector('img[alt]');
    const text = el.getAttribute('aria-label') || el.innerText || el.value ||
      el.getAttribute('title') || (img ? img.getAttribute('alt') : '') || '';
    return text.replace(/\s+/g, ' ').trim().slice(0, MAX_LABEL);
  }

  const out = [];
  let ref = 0;
  for (const el of document.querySelectorAll(SELECTOR)) {
    const role = roleOf(el);
    if (!role) continue;
    const r = el.getBoundingClientRect();
    const id = ref++;
    el.setAttribute('data-pp-ref', String(id));
    out.push({
      dom_ref: id,
      role: role,
      rect: { x: r.x, y: r.y, width: r.width, height: r.height },
      visible: isVisible(el, r),
      label: labelOf(el),
      placeholder: el.getAttribute('placeholder') || null,
    });
  }
  return JSON.stringify(out);
})()
"#;

/// Clicks the first visible button-like element whose text matches one of the
/// consent phrases. Evaluates to `true` when something was clicked.
const CONSENT_JS: &str = r#"
((phrases) => {
  const candidates = document.querySelectorAll('button, [role="button"], a, input[type="submit"], input[type="button"]');
  for (const el of candidates) {
    const text = (el.getAttribute('aria-label') || el.innerText || el.value || '').toLowerCase().replace(/\s+/g, ' ').trim();
    if (!text || text.length > 60) continue;
    const r = el.getBoundingClientRect();
    if (r.width === 0 || r.height === 0) continue;
    if (phrases.some(p => text === p || text.startsWith(p + ' ') || text.endsWith(' ' + p))) {
      el.click();
      return true;
    }
  }
  return false;
})(__PHRASES__)
"#;

pub fn elements_script() -> String {
    ELEMENTS_JS.replace("__MAX_LABEL__", &MAX_LABEL_CHARS.to_string())
}

pub fn consent_script(phrases: &[String]) -> String {
    let lowered: Vec<String> = phrases.iter().map(|p| p.to_lowercase()).collect();
    let json = serde_json::to_string(&lowered).unwrap_or_else(|_| "[]".to_string());
    CONSENT_JS.replace("__PHRASES__", &json)
}

pub fn scroll_script(direction: ScrollDirection, pixels: u32) -> String {
    let dy = match direction {
        ScrollDirection::Down => i64::from(pixels),
        ScrollDirection::Up => -i64::from(pixels),
    };
    format!("window.scrollBy(0, {}); true", dy)
}

/// CSS selector for an element stamped by the extraction script.
pub fn ref_selector(dom_ref: usize) -> String {
    format!("[{}=\"{}\"]", REF_ATTR, dom_ref)
}

pub fn parse_elements(raw_json: &str) -> serde_json::Result<Vec<RawElement>> {
    if raw_json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw_json)
}

/// List interactable elements on the current page.
pub fn list_elements(tab: &Arc<Tab>) -> Result<Vec<RawElement>> {
    let raw = eval_string(tab, &elements_script())?;
    parse_elements(&raw).context("element extraction returned malformed JSON")
}

/// Click a consent control if one is showing.
pub fn dismiss_consent(tab: &Arc<Tab>, phrases: &[String]) -> Result<bool> {
    let result = tab.evaluate(&consent_script(phrases), false)?;
    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
}

pub fn scroll(tab: &Arc<Tab>, direction: ScrollDirection, pixels: u32) -> Result<()> {
    tab.evaluate(&scroll_script(direction, pixels), false)?;
    Ok(())
}

/// Get the current page URL.
pub fn get_current_url(tab: &Arc<Tab>) -> Result<String> {
    let url = eval_string(tab, "window.location.href")?;
    if url.is_empty() {
        return Ok(tab.get_url());
    }
    Ok(url)
}

fn eval_string(tab: &Arc<Tab>, js: &str) -> Result<String> {
    let result = tab.evaluate(js, false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}
