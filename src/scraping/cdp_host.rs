//! `PageHost` over a live `chromiumoxide` tab.
//!
//! Every DOM interaction is a small script evaluated in the page. Navigations
//! are started from script too, so they are always asynchronous: the caller
//! waits for the next document before building the next page agent.

use crate::agent::host::{FilterControlSnapshot, HostError, PageHost};
use async_trait::async_trait;
use chromiumoxide::Page;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// JSON string literal, which is also a valid JS string literal.
fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn js_str_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

const FILTER_CONTROLS_SCRIPT: &str = r#"
(containers) => {
  const out = [];
  for (const sel of containers) {
    let roots;
    try { roots = document.querySelectorAll(sel); } catch (_) { continue; }
    for (const root of roots) {
      for (const el of root.querySelectorAll('input, select, textarea')) {
        const tag = el.tagName.toLowerCase();
        const type = tag === 'input' ? (el.type || 'text').toLowerCase() : null;
        const checkable = type === 'checkbox' || type === 'radio';
        out.push({
          tagName: tag,
          controlType: type,
          name: el.name || null,
          id: el.id || null,
          value: el.value ?? null,
          checked: checkable ? !!el.checked : null,
        });
      }
    }
  }
  return out;
}
"#;

const APPLY_FILTERS_SCRIPT: &str = r#"
(containers, controls) => {
  const roots = [];
  for (const sel of containers) {
    try { roots.push(...document.querySelectorAll(sel)); } catch (_) {}
  }
  const find = (c) => {
    for (const root of roots) {
      if (c.id) {
        const byId = root.querySelector('#' + CSS.escape(c.id));
        if (byId) return byId;
      }
      if (c.name) {
        const all = root.querySelectorAll('[name="' + CSS.escape(c.name) + '"]');
        for (const el of all) {
          if (c.controlType === 'radio' || c.controlType === 'checkbox') {
            if (el.value === c.value) return el;
          } else {
            return el;
          }
        }
      }
    }
    return null;
  };
  let applied = 0;
  for (const c of controls) {
    const el = find(c);
    if (!el) continue;
    if (c.controlType === 'radio' || c.controlType === 'checkbox') {
      if (el.checked === !!c.checked) continue;
      el.checked = !!c.checked;
    } else {
      if (el.value === (c.value ?? '')) continue;
      el.value = c.value ?? '';
    }
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    applied += 1;
  }
  return applied;
}
"#;

pub struct CdpPageHost {
    page: Page,
    context_id: String,
    context: Mutex<HashMap<String, String>>,
}

impl CdpPageHost {
    pub fn new(page: Page) -> Self {
        Self {
            page,
            context_id: format!("tab-{}", uuid::Uuid::new_v4().simple()),
            context: Mutex::new(HashMap::new()),
        }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn eval(&self, script: String) -> Result<Value, HostError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| HostError::Script(e.to_string()))?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    fn context_map(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, HostError> {
        self.context
            .lock()
            .map_err(|_| HostError::Detached("context store poisoned".into()))
    }
}

#[async_trait]
impl PageHost for CdpPageHost {
    fn context_id(&self) -> &str {
        &self.context_id
    }

    async fn current_url(&self) -> Result<String, HostError> {
        match self.eval("location.href".into()).await? {
            Value::String(url) => Ok(url),
            other => Err(HostError::Detached(format!("no location: {}", other))),
        }
    }

    async fn referrer(&self) -> Result<Option<String>, HostError> {
        Ok(self
            .eval("document.referrer".into())
            .await?
            .as_str()
            .filter(|r| !r.is_empty())
            .map(str::to_string))
    }

    async fn history_length(&self) -> Result<usize, HostError> {
        Ok(self.eval("history.length".into()).await?.as_u64().unwrap_or(0) as usize)
    }

    async fn go_back(&self) -> Result<(), HostError> {
        self.eval("history.back(); true".into())
            .await
            .map(|_| ())
            .map_err(|e| HostError::Navigation(e.to_string()))
    }

    async fn navigate(&self, url: &str) -> Result<(), HostError> {
        debug!("cdp host: navigating to {}", url);
        self.eval(format!("location.assign({}); true", js_str(url)))
            .await
            .map(|_| ())
            .map_err(|e| HostError::Navigation(e.to_string()))
    }

    async fn html(&self) -> Result<String, HostError> {
        self.page
            .content()
            .await
            .map_err(|e| HostError::Script(e.to_string()))
    }

    async fn query_count(&self, selector: &str) -> Result<usize, HostError> {
        let script = format!(
            "(() => {{ try {{ return document.querySelectorAll({}).length; }} catch (_) {{ return -1; }} }})()",
            js_str(selector)
        );
        match self.eval(script).await?.as_i64() {
            Some(n) if n >= 0 => Ok(n as usize),
            _ => Err(HostError::Script(format!("invalid selector {}", selector))),
        }
    }

    async fn click_card(
        &self,
        card_selector: &str,
        link_selector: Option<&str>,
        index: usize,
    ) -> Result<bool, HostError> {
        let link = link_selector.map(js_str).unwrap_or_else(|| "null".into());
        let script = format!(
            r#"(() => {{
  const card = document.querySelectorAll({card})[{index}];
  if (!card) return false;
  const link = ({link} && card.querySelector({link}))
    || (card.tagName === 'A' ? card : card.querySelector('a[href]'));
  const target = link || card;
  if (target.tagName === 'A') target.removeAttribute('target');
  target.scrollIntoView({{ block: 'center' }});
  target.click();
  return true;
}})()"#,
            card = js_str(card_selector),
        );
        Ok(self.eval(script).await?.as_bool().unwrap_or(false))
    }

    async fn scroll_top(&self) -> Result<f64, HostError> {
        Ok(self
            .eval("window.scrollY || document.documentElement.scrollTop || 0".into())
            .await?
            .as_f64()
            .unwrap_or(0.0))
    }

    async fn scroll_to(&self, top: f64) -> Result<(), HostError> {
        self.eval(format!("window.scrollTo(0, {}); true", top))
            .await
            .map(|_| ())
    }

    async fn filter_controls(
        &self,
        containers: &[String],
    ) -> Result<Vec<FilterControlSnapshot>, HostError> {
        let script = format!("({})({})", FILTER_CONTROLS_SCRIPT.trim(), js_str_list(containers));
        serde_json::from_value(self.eval(script).await?)
            .map_err(|e| HostError::Script(format!("unexpected filter controls: {}", e)))
    }

    async fn apply_filter_controls(
        &self,
        containers: &[String],
        controls: &[FilterControlSnapshot],
    ) -> Result<usize, HostError> {
        let controls =
            serde_json::to_string(controls).map_err(|e| HostError::Script(e.to_string()))?;
        let script = format!(
            "({})({}, {})",
            APPLY_FILTERS_SCRIPT.trim(),
            js_str_list(containers),
            controls
        );
        Ok(self.eval(script).await?.as_u64().unwrap_or(0) as usize)
    }

    async fn page_get(&self, key: &str) -> Result<Option<String>, HostError> {
        Ok(self
            .eval(format!("sessionStorage.getItem({})", js_str(key)))
            .await?
            .as_str()
            .map(str::to_string))
    }

    async fn page_set(&self, key: &str, value: &str) -> Result<(), HostError> {
        self.eval(format!(
            "sessionStorage.setItem({}, {}); true",
            js_str(key),
            js_str(value)
        ))
        .await
        .map(|_| ())
    }

    async fn page_remove(&self, key: &str) -> Result<(), HostError> {
        self.eval(format!("sessionStorage.removeItem({}); true", js_str(key)))
            .await
            .map(|_| ())
    }

    async fn context_get(&self, key: &str) -> Result<Option<String>, HostError> {
        Ok(self.context_map()?.get(key).cloned())
    }

    async fn context_set(&self, key: &str, value: &str) -> Result<(), HostError> {
        self.context_map()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn context_remove(&self, key: &str) -> Result<(), HostError> {
        self.context_map()?.remove(key);
        Ok(())
    }
}
