use std::rc::Rc;

use anyhow::Result;
use rquickjs::function::Opt;
use rquickjs::{Context, Ctx, Function, IntoJs, Persistent, Value as JsValue};

use super::agent::ScriptAgent;
use crate::bridge::error::BridgeError;
use crate::bridge::scope::{ContextRef, ScopeId};
use crate::bridge::value::Value;

/// Install `frontier.bridge` into `context`, bound to the document `scope`.
pub fn install_bridge(context: &Context, agent: Rc<ScriptAgent>, scope: ScopeId) -> Result<()> {
    context
        .with(|ctx| install_bridge_functions(&ctx, agent, scope))
        .map_err(anyhow::Error::from)
}

fn install_bridge_functions<'js>(
    ctx: &Ctx<'js>,
    agent: Rc<ScriptAgent>,
    scope: ScopeId,
) -> rquickjs::Result<()> {
    let global = ctx.globals();
    let owner = ContextRef::new(scope);

    {
        let agent = Rc::clone(&agent);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  name: String,
                  params_json: String,
                  callback: Function<'js>|
                  -> rquickjs::Result<u32> {
                let callback = Persistent::save(&ctx, callback);
                match agent.call(owner, &name, &params_json, callback) {
                    Ok(id) => Ok(id.get()),
                    Err(err) => bridge_error(&ctx, err),
                }
            },
        )?
        .with_name("__frontier_bridge_call")?;
        global.set("__frontier_bridge_call", func)?;
    }

    {
        let agent = Rc::clone(&agent);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  name: String,
                  function: Function<'js>,
                  replace: Opt<bool>|
                  -> rquickjs::Result<()> {
                let function = Persistent::save(&ctx, function);
                let replace = replace.0.unwrap_or(false);
                match agent.register(scope, &name, function, replace) {
                    Ok(()) => Ok(()),
                    Err(err) => bridge_error(&ctx, err),
                }
            },
        )?
        .with_name("__frontier_bridge_register")?;
        global.set("__frontier_bridge_register", func)?;
    }

    {
        let agent = Rc::clone(&agent);
        let func = Function::new(ctx.clone(), move |name: String| -> rquickjs::Result<bool> {
            Ok(agent.unregister(scope, &name))
        })?
        .with_name("__frontier_bridge_unregister")?;
        global.set("__frontier_bridge_unregister", func)?;
    }

    {
        let agent = Rc::clone(&agent);
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, args_json: Opt<String>| -> rquickjs::Result<()> {
                let parsed = args_json
                    .0
                    .as_deref()
                    .map(serde_json::from_str::<serde_json::Value>);
                let args = match parsed {
                    None => Vec::new(),
                    Some(Ok(serde_json::Value::Array(items))) => {
                        items.iter().map(Value::from_json).collect()
                    }
                    Some(Ok(other)) => vec![Value::from_json(&other)],
                    Some(Err(err)) => {
                        let message = format!("frontier.bridge: invalid message arguments: {err}");
                        let value = message.into_js(&ctx)?;
                        return Err(ctx.throw(value));
                    }
                };
                match agent.send_message(scope, &name, args) {
                    Ok(()) => Ok(()),
                    Err(err) => bridge_error(&ctx, err),
                }
            },
        )?
        .with_name("__frontier_bridge_send")?;
        global.set("__frontier_bridge_send", func)?;
    }

    match ctx.eval::<(), _>(BRIDGE_BOOTSTRAP.as_bytes()) {
        Ok(()) => Ok(()),
        Err(err) => {
            if let rquickjs::Error::Exception = err {
                let value: JsValue<'_> = ctx.catch();
                tracing::error!(target: "quickjs", "bridge bootstrap failed: {:?}", value);
            }
            Err(err)
        }
    }
}

fn bridge_error<T>(ctx: &Ctx<'_>, err: BridgeError) -> rquickjs::Result<T> {
    tracing::debug!(target: "bridge", error = %err, "bridge operation refused");
    let message = format!("frontier.bridge: {err}");
    let value = message.into_js(ctx)?;
    Err(ctx.throw(value))
}

const BRIDGE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const frontier = global.frontier || (global.frontier = {});

    const parse = (text) => {
        if (typeof text !== 'string' || text.length === 0) {
            return undefined;
        }
        try {
            return JSON.parse(text);
        } catch (err) {
            return text;
        }
    };

    const rethrow = (err) => {
        throw typeof err === 'string' ? new Error(err) : err;
    };

    const call = (name, params, callback) => {
        if (typeof params === 'function' && callback === undefined) {
            callback = params;
            params = undefined;
        }
        if (typeof callback !== 'function') {
            throw new TypeError('frontier.bridge.call: callback must be a function');
        }
        const paramsJson = params === undefined ? '' : JSON.stringify(params);
        try {
            return global.__frontier_bridge_call(String(name), paramsJson, (hasError, payload) => {
                const value = parse(payload);
                if (hasError) {
                    callback(value === undefined ? {} : value, undefined);
                } else {
                    callback(null, value);
                }
            });
        } catch (err) {
            rethrow(err);
        }
    };

    const register = (name, fn, replace) => {
        if (typeof fn !== 'function') {
            throw new TypeError('frontier.bridge.register: handler must be a function');
        }
        const handler = (paramsJson) => {
            const json = JSON.stringify(fn(parse(paramsJson)));
            return json === undefined ? 'null' : json;
        };
        try {
            global.__frontier_bridge_register(String(name), handler, replace === true);
        } catch (err) {
            rethrow(err);
        }
    };

    const unregister = (name) => global.__frontier_bridge_unregister(String(name));

    const sendMessage = (name, args) => {
        const list = args === undefined ? [] : Array.isArray(args) ? args : [args];
        try {
            global.__frontier_bridge_send(String(name), JSON.stringify(list));
        } catch (err) {
            rethrow(err);
        }
    };

    frontier.bridge = Object.freeze({ call, register, unregister, sendMessage });
})();
"#;
