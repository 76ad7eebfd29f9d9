//! Breakpoint Manager (C4, §4.4).
//!
//! Owns the set of breakpoints the caller has asked for, independent of
//! whatever CDP id they currently resolve to. Breakpoints survive source
//! reloads and reconnect attempts at the model level even though their CDP
//! ids do not; `reattempt_unresolved` is how a later `scriptParsed` event
//! gives a previously-unresolved breakpoint a second chance.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{KernelError, Result};
use crate::scripts::ScriptRegistry;
use crate::source_map::SourceMapCache;
use crate::transport::InspectorTransport;
use crate::types::{CdpBreakpointId, SourceLocation};

/// A hit-count gate on a breakpoint: pause only every Nth hit, or once the
/// hit count crosses/clears a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    Equal(u64),
    GreaterThan(u64),
    GreaterOrEqual(u64),
    LessThan(u64),
    LessOrEqual(u64),
    Modulo(u64),
}

impl HitCondition {
    pub fn is_satisfied(&self, hit_count: u64) -> bool {
        match *self {
            HitCondition::Equal(n) => hit_count == n,
            HitCondition::GreaterThan(n) => hit_count > n,
            HitCondition::GreaterOrEqual(n) => hit_count >= n,
            HitCondition::LessThan(n) => hit_count < n,
            HitCondition::LessOrEqual(n) => hit_count <= n,
            HitCondition::Modulo(n) => n != 0 && hit_count % n == 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    Standard,
    Logpoint { template: String },
    Function { function_name: String },
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: String,
    pub file: String,
    pub line: u32,
    pub kind: BreakpointKind,
    pub enabled: bool,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    pub hit_count: u64,
    /// The CDP id this breakpoint currently resolves to, if it has been
    /// successfully installed. `None` means "stored, not yet resolved" —
    /// legal and retried automatically on the next matching `scriptParsed`.
    pub cdp_id: Option<CdpBreakpointId>,
}

#[derive(Default)]
pub struct BreakpointManager {
    breakpoints: RwLock<HashMap<String, Breakpoint>>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint_id(&self) -> String {
        format!("bp_{}", random_hex16())
    }

    pub async fn create_standard(
        &self,
        transport: Option<&InspectorTransport>,
        scripts: &ScriptRegistry,
        source_maps: &SourceMapCache,
        file: &str,
        line: u32,
        condition: Option<String>,
    ) -> Result<Breakpoint> {
        self.create(
            transport,
            scripts,
            source_maps,
            file,
            line,
            BreakpointKind::Standard,
            condition,
        )
        .await
    }

    pub async fn create_logpoint(
        &self,
        transport: Option<&InspectorTransport>,
        scripts: &ScriptRegistry,
        source_maps: &SourceMapCache,
        file: &str,
        line: u32,
        template: String,
    ) -> Result<Breakpoint> {
        let rewritten = logpoint_expression(&template);
        self.create(
            transport,
            scripts,
            source_maps,
            file,
            line,
            BreakpointKind::Logpoint { template },
            Some(rewritten),
        )
        .await
    }

    /// Stores a function breakpoint without attempting CDP resolution.
    /// `Debugger.setBreakpointOnFunctionCall` requires an object id for the
    /// function, which this kernel has no way to obtain without first
    /// pausing and evaluating — so function breakpoints are recorded but
    /// left unresolved until that capability exists.
    pub async fn create_function(&self, function_name: String) -> Result<Breakpoint> {
        warn!(
            function_name = %function_name,
            "function breakpoints are stored but never resolved against cdp"
        );
        let id = self.mint_id();
        let breakpoint = Breakpoint {
            id: id.clone(),
            file: String::new(),
            line: 0,
            kind: BreakpointKind::Function { function_name },
            enabled: true,
            condition: None,
            hit_condition: None,
            hit_count: 0,
            cdp_id: None,
        };
        self.breakpoints
            .write()
            .await
            .insert(id, breakpoint.clone());
        Ok(breakpoint)
    }

    async fn create(
        &self,
        transport: Option<&InspectorTransport>,
        scripts: &ScriptRegistry,
        source_maps: &SourceMapCache,
        file: &str,
        line: u32,
        kind: BreakpointKind,
        condition: Option<String>,
    ) -> Result<Breakpoint> {
        let id = self.mint_id();
        let mut breakpoint = Breakpoint {
            id: id.clone(),
            file: file.to_string(),
            line,
            kind,
            enabled: true,
            condition,
            hit_condition: None,
            hit_count: 0,
            cdp_id: None,
        };

        if let Some(cdp_id) = resolve_on_cdp(transport, scripts, source_maps, &breakpoint).await? {
            breakpoint.cdp_id = Some(cdp_id);
        } else {
            debug!(file, line, "breakpoint stored unresolved; will retry on scriptParsed");
        }

        self.breakpoints
            .write()
            .await
            .insert(id, breakpoint.clone());
        Ok(breakpoint)
    }

    pub async fn remove(&self, transport: Option<&InspectorTransport>, id: &str) -> Result<()> {
        let removed = self.breakpoints.write().await.remove(id);
        if let Some(bp) = removed {
            if let (Some(transport), Some(cdp_id)) = (transport, bp.cdp_id) {
                let _ = transport
                    .send(
                        "Debugger.removeBreakpoint",
                        serde_json::json!({ "breakpointId": cdp_id }),
                        None,
                    )
                    .await;
            }
            Ok(())
        } else {
            Err(KernelError::InvalidArgument(format!(
                "no breakpoint with id {id}"
            )))
        }
    }

    pub async fn enable(
        &self,
        transport: Option<&InspectorTransport>,
        scripts: &ScriptRegistry,
        source_maps: &SourceMapCache,
        id: &str,
    ) -> Result<()> {
        self.set_enabled(transport, scripts, source_maps, id, true).await
    }

    pub async fn disable(&self, transport: Option<&InspectorTransport>, id: &str) -> Result<()> {
        let mut guard = self.breakpoints.write().await;
        let bp = guard
            .get_mut(id)
            .ok_or_else(|| KernelError::InvalidArgument(format!("no breakpoint with id {id}")))?;
        bp.enabled = false;
        let cdp_id = bp.cdp_id.take();
        drop(guard);
        if let (Some(transport), Some(cdp_id)) = (transport, cdp_id) {
            let _ = transport
                .send(
                    "Debugger.removeBreakpoint",
                    serde_json::json!({ "breakpointId": cdp_id }),
                    None,
                )
                .await;
        }
        Ok(())
    }

    pub async fn toggle(
        &self,
        transport: Option<&InspectorTransport>,
        scripts: &ScriptRegistry,
        source_maps: &SourceMapCache,
        id: &str,
    ) -> Result<bool> {
        let currently_enabled = {
            let guard = self.breakpoints.read().await;
            guard
                .get(id)
                .map(|bp| bp.enabled)
                .ok_or_else(|| KernelError::InvalidArgument(format!("no breakpoint with id {id}")))?
        };
        self.set_enabled(transport, scripts, source_maps, id, !currently_enabled)
            .await?;
        Ok(!currently_enabled)
    }

    async fn set_enabled(
        &self,
        transport: Option<&InspectorTransport>,
        scripts: &ScriptRegistry,
        source_maps: &SourceMapCache,
        id: &str,
        enabled: bool,
    ) -> Result<()> {
        let mut guard = self.breakpoints.write().await;
        let bp = guard
            .get_mut(id)
            .ok_or_else(|| KernelError::InvalidArgument(format!("no breakpoint with id {id}")))?;
        bp.enabled = enabled;

        if !enabled {
            if let Some(cdp_id) = bp.cdp_id.take() {
                drop(guard);
                if let Some(transport) = transport {
                    let _ = transport
                        .send(
                            "Debugger.removeBreakpoint",
                            serde_json::json!({ "breakpointId": cdp_id }),
                            None,
                        )
                        .await;
                }
                return Ok(());
            }
            return Ok(());
        }

        if bp.cdp_id.is_none() {
            let snapshot = bp.clone();
            drop(guard);
            if let Some(cdp_id) = resolve_on_cdp(transport, scripts, source_maps, &snapshot).await? {
                if let Some(bp) = self.breakpoints.write().await.get_mut(id) {
                    bp.cdp_id = Some(cdp_id);
                }
            }
        }
        Ok(())
    }

    pub async fn set_hit_count_condition(&self, id: &str, condition: HitCondition) -> Result<()> {
        let mut guard = self.breakpoints.write().await;
        let bp = guard
            .get_mut(id)
            .ok_or_else(|| KernelError::InvalidArgument(format!("no breakpoint with id {id}")))?;
        bp.hit_condition = Some(condition);
        Ok(())
    }

    pub async fn list(&self) -> Vec<Breakpoint> {
        self.breakpoints.read().await.values().cloned().collect()
    }

    pub async fn list_by_file(&self, file: &str) -> Vec<Breakpoint> {
        self.breakpoints
            .read()
            .await
            .values()
            .filter(|bp| bp.file == file)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Breakpoint> {
        self.breakpoints.read().await.get(id).cloned()
    }

    pub async fn has(&self, id: &str) -> bool {
        self.breakpoints.read().await.contains_key(id)
    }

    pub async fn count(&self) -> usize {
        self.breakpoints.read().await.len()
    }

    pub async fn clear_all(&self) {
        self.breakpoints.write().await.clear();
    }

    /// Record a hit on the breakpoint identified by `cdp_id` and report
    /// whether it should actually pause the session, per its hit-count
    /// condition (no condition means "always pause").
    pub async fn record_hit(&self, cdp_id: &str) -> bool {
        let mut guard = self.breakpoints.write().await;
        let Some(bp) = guard.values_mut().find(|bp| bp.cdp_id.as_deref() == Some(cdp_id)) else {
            return true;
        };
        bp.hit_count += 1;
        match bp.hit_condition {
            Some(condition) => condition.is_satisfied(bp.hit_count),
            None => true,
        }
    }

    /// Called when a new script is parsed; any breakpoint still unresolved
    /// against that file gets another shot at `Debugger.setBreakpointByUrl`.
    pub async fn reattempt_unresolved(
        &self,
        transport: &InspectorTransport,
        scripts: &ScriptRegistry,
        source_maps: &SourceMapCache,
        parsed_url: &str,
    ) {
        let candidates: Vec<Breakpoint> = {
            let guard = self.breakpoints.read().await;
            guard
                .values()
                .filter(|bp| bp.cdp_id.is_none() && !bp.file.is_empty())
                .cloned()
                .collect()
        };
        for bp in candidates {
            if !url_could_match(parsed_url, &bp.file) {
                continue;
            }
            if let Ok(Some(cdp_id)) = resolve_on_cdp(Some(transport), scripts, source_maps, &bp).await {
                if let Some(stored) = self.breakpoints.write().await.get_mut(&bp.id) {
                    stored.cdp_id = Some(cdp_id);
                    debug!(id = %bp.id, "unresolved breakpoint resolved after scriptParsed");
                }
            }
        }
    }
}

/// 16 random hex bytes (32 hex digits), generated without pulling in `rand`
/// or `uuid`: `RandomState` draws its SipHash keys from the OS on every
/// construction, so hashing nothing with two independently-constructed
/// hashers yields two effectively-random `u64`s.
fn random_hex16() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let high = RandomState::new().build_hasher().finish();
    let low = RandomState::new().build_hasher().finish();
    format!("{high:016x}{low:016x}")
}

/// Render an absolute filesystem path as the `file://` URL
/// `Debugger.setBreakpointByUrl` expects. A `bp.file` that's already a URL
/// (another scheme, or already `file://`) is passed through unchanged.
fn to_file_url(file: &str) -> String {
    if file.contains("://") {
        file.to_string()
    } else {
        format!("file://{file}")
    }
}

fn url_could_match(url: &str, file: &str) -> bool {
    let basename = file.rsplit(['/', '\\']).next().unwrap_or(file);
    url.ends_with(file) || url.contains(basename)
}

async fn resolve_on_cdp(
    transport: Option<&InspectorTransport>,
    scripts: &ScriptRegistry,
    source_maps: &SourceMapCache,
    bp: &Breakpoint,
) -> Result<Option<CdpBreakpointId>> {
    if matches!(bp.kind, BreakpointKind::Function { .. }) {
        return Ok(None);
    }
    // No transport yet (pre-`start()`): store the breakpoint unresolved,
    // same as a script that hasn't parsed yet. `reattempt_unresolved` picks
    // it back up once a transport exists and scripts start parsing.
    let Some(transport) = transport else {
        return Ok(None);
    };
    if !transport.is_connected() {
        return Err(KernelError::NotConnected);
    }

    // §4.4/§4.5: a breakpoint set against a `.ts`/`.tsx` source is translated
    // through the source-map cache to the compiled location V8 actually runs
    // before it's ever put on the wire; plain JS has no map and passes through.
    let (wire_file, wire_line) = match source_maps
        .source_to_compiled(SourceLocation {
            file: &bp.file,
            line: bp.line,
            column: 0,
        })
        .await
    {
        Some(compiled) => (compiled.file, compiled.line),
        None => (bp.file.clone(), bp.line),
    };
    let line_number = wire_line.saturating_sub(1);

    let mut params = serde_json::json!({
        "url": to_file_url(&wire_file),
        "lineNumber": line_number,
        "columnNumber": 0,
    });
    if let Some(condition) = &bp.condition {
        params["condition"] = Value::String(condition.clone());
    }

    match transport
        .send("Debugger.setBreakpointByUrl", params, None)
        .await
    {
        Ok(result) => {
            if let Some(id) = result.get("breakpointId").and_then(Value::as_str) {
                return Ok(Some(id.to_string()));
            }
        }
        Err(KernelError::CdpError { .. }) => {
            // fall through to the script-registry fallback below
        }
        Err(other) => return Err(other),
    }

    let Some(script) = scripts.resolve_fallback(&wire_file).await else {
        return Ok(None);
    };

    let mut params = serde_json::json!({
        "location": {
            "scriptId": script.script_id,
            "lineNumber": line_number,
            "columnNumber": 0,
        },
    });
    if let Some(condition) = &bp.condition {
        params["condition"] = Value::String(condition.clone());
    }

    match transport.send("Debugger.setBreakpoint", params, None).await {
        Ok(result) => Ok(result
            .get("breakpointId")
            .and_then(Value::as_str)
            .map(str::to_string)),
        Err(KernelError::CdpError { .. }) => Ok(None),
        Err(other) => Err(other),
    }
}

/// Rewrite a logpoint template (`"value is {x}"`) into the conditional
/// breakpoint expression CDP actually understands: an expression that logs
/// and always evaluates false, so the debugger never truly pauses.
fn logpoint_expression(template: &str) -> String {
    let mut args = Vec::new();
    let mut format = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut expr = String::new();
            let mut closed = false;
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    closed = true;
                    break;
                }
                expr.push(c2);
            }
            if closed && !expr.trim().is_empty() {
                format.push_str("%s");
                args.push(expr.trim().to_string());
                continue;
            }
            format.push('{');
            format.push_str(&expr);
            if closed {
                format.push('}');
            }
            continue;
        }
        format.push(c);
    }

    let mut call_args = vec![format!("{:?}", format)];
    call_args.extend(args);
    format!("console.log({}), false", call_args.join(", "))
}
