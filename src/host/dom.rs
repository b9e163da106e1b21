//! Document tree and DOM event imports.

use super::{count, fallible, flag, infallible};
use crate::codec;
use crate::error::BridgeResult;
use crate::event_loop;
use crate::guest::HostGuest;
use crate::heap::Handle;
use crate::runtime::host::{InterfaceBuilder, LinkerError};
use crate::state::BridgeState;
use crate::value::{HostValue, NodeId};
use wasmtime::Caller;

fn node(g: &HostGuest<'_>, h: i32) -> BridgeResult<NodeId> {
    g.state().node(Handle::from_abi(h))
}

fn text(g: &mut HostGuest<'_>, ptr: i32, len: i32) -> BridgeResult<String> {
    codec::decode_cached(g, ptr as u32, len as u32)
}

fn new_node(g: &mut HostGuest<'_>, id: NodeId) -> i32 {
    let value = g.state().node_value(id);
    g.state_mut().alloc(value).to_abi()
}

fn maybe_node(g: &mut HostGuest<'_>, id: Option<NodeId>) -> i32 {
    id.map_or(hostbind_abi::NONE, |id| new_node(g, id))
}

pub(super) fn register(iface: &mut InterfaceBuilder<'_, '_, BridgeState>) -> Result<(), LinkerError> {
    iface
        .func_raw("document", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "document", |g| Ok(g.state_mut().alloc(HostValue::Document).to_abi()))
        })?
        .func_raw("body", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "body", |g| {
                let body = g.state().document.body();
                Ok(new_node(g, body))
            })
        })?
        .func_raw("head", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "head", |g| {
                let head = g.state().document.head();
                Ok(new_node(g, head))
            })
        })?
        .func_raw("create_element", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            fallible(caller, "create_element", |g| {
                let tag = text(g, ptr, len)?;
                let id = g.state_mut().document.create_element(&tag)?;
                Ok(new_node(g, id))
            })
        })?
        .func_raw(
            "create_element_ns",
            |caller: Caller<'_, BridgeState>, ns_ptr: i32, ns_len: i32, ptr: i32, len: i32| {
                fallible(caller, "create_element_ns", |g| {
                    let namespace = if ns_ptr == 0 && ns_len == 0 {
                        None
                    } else {
                        Some(text(g, ns_ptr, ns_len)?)
                    };
                    let tag = text(g, ptr, len)?;
                    let id = g
                        .state_mut()
                        .document
                        .create_element_ns(namespace.as_deref(), &tag)?;
                    Ok(new_node(g, id))
                })
            },
        )?
        .func_raw("create_text_node", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            fallible(caller, "create_text_node", |g| {
                let data = text(g, ptr, len)?;
                let id = g.state_mut().document.create_text(&data);
                Ok(new_node(g, id))
            })
        })?
        .func_raw("create_comment", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            fallible(caller, "create_comment", |g| {
                let data = text(g, ptr, len)?;
                let id = g.state_mut().document.create_comment(&data);
                Ok(new_node(g, id))
            })
        })?
        .func_raw("create_fragment", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "create_fragment", |g| {
                let id = g.state_mut().document.create_fragment();
                Ok(new_node(g, id))
            })
        })?
        .func_raw("clone_node", |caller: Caller<'_, BridgeState>, h: i32, deep: i32| {
            fallible(caller, "clone_node", |g| {
                let source = node(g, h)?;
                let id = g.state_mut().document.clone_node(source, deep != 0)?;
                Ok(new_node(g, id))
            })
        })?
        .func_raw("node_remove", |caller: Caller<'_, BridgeState>, h: i32| {
            fallible(caller, "node_remove", |g| {
                let id = node(g, h)?;
                g.state_mut().document.remove(id)
            })
        })?
        .func_raw(
            "insert_before",
            |caller: Caller<'_, BridgeState>, parent: i32, child: i32, reference: i32| {
                fallible(caller, "insert_before", |g| {
                    let parent = node(g, parent)?;
                    let child = node(g, child)?;
                    let reference = match reference {
                        hostbind_abi::NONE => None,
                        r => Some(node(g, r)?),
                    };
                    g.state_mut().document.insert_before(parent, child, reference)
                })
            },
        )?
        .func_raw("before", |caller: Caller<'_, BridgeState>, h: i32, new: i32| {
            fallible(caller, "before", |g| {
                let (target, new) = (node(g, h)?, node(g, new)?);
                g.state_mut().document.before(target, new)
            })
        })?
        .func_raw("append_child", |caller: Caller<'_, BridgeState>, parent: i32, child: i32| {
            fallible(caller, "append_child", |g| {
                let (parent, child) = (node(g, parent)?, node(g, child)?);
                g.state_mut().document.append_child(parent, child)
            })
        })?
        .func_raw("remove_child", |caller: Caller<'_, BridgeState>, parent: i32, child: i32| {
            fallible(caller, "remove_child", |g| {
                let (parent, child) = (node(g, parent)?, node(g, child)?);
                g.state_mut().document.remove_child(parent, child)
            })
        })?
        .func_raw(
            "get_attribute",
            |caller: Caller<'_, BridgeState>, out: i32, h: i32, ptr: i32, len: i32| {
                fallible(caller, "get_attribute", |g| {
                    let id = node(g, h)?;
                    let name = text(g, ptr, len)?;
                    let value = g.state().document.get_attribute(id, &name)?;
                    g.return_opt_string(out as u32, value.as_deref())
                })
            },
        )?
        .func_raw(
            "set_attribute",
            |caller: Caller<'_, BridgeState>, h: i32, n_ptr: i32, n_len: i32, v_ptr: i32, v_len: i32| {
                fallible(caller, "set_attribute", |g| {
                    let id = node(g, h)?;
                    let name = text(g, n_ptr, n_len)?;
                    let value = text(g, v_ptr, v_len)?;
                    g.state_mut().document.set_attribute(id, &name, &value)
                })
            },
        )?
        .func_raw("remove_attribute", |caller: Caller<'_, BridgeState>, h: i32, ptr: i32, len: i32| {
            fallible(caller, "remove_attribute", |g| {
                let id = node(g, h)?;
                let name = text(g, ptr, len)?;
                g.state_mut().document.remove_attribute(id, &name)
            })
        })?
        .func_raw("set_text_content", |caller: Caller<'_, BridgeState>, h: i32, ptr: i32, len: i32| {
            fallible(caller, "set_text_content", |g| {
                let id = node(g, h)?;
                let data = text(g, ptr, len)?;
                let state = g.state_mut();
                state.document.set_text_content(id, &data)?;
                state.collect_orphans();
                Ok(())
            })
        })?
        .func_raw("text_content", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "text_content", |g| {
                let id = node(g, h)?;
                let data = g.state().document.text_content(id)?;
                g.return_opt_string(out as u32, data.as_deref())
            })
        })?
        .func_raw("set_inner_html", |caller: Caller<'_, BridgeState>, h: i32, ptr: i32, len: i32| {
            fallible(caller, "set_inner_html", |g| {
                let id = node(g, h)?;
                let html = text(g, ptr, len)?;
                let state = g.state_mut();
                state.document.set_inner_html(id, &html)?;
                state.collect_orphans();
                Ok(())
            })
        })?
        .func_raw("inner_html", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "inner_html", |g| {
                let id = node(g, h)?;
                let html = g.state().document.inner_html(id)?;
                g.return_string(out as u32, &html)
            })
        })?
        .func_raw("outer_html", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "outer_html", |g| {
                let id = node(g, h)?;
                let html = g.state().document.outer_html(id)?;
                g.return_string(out as u32, &html)
            })
        })?
        .func_raw("get_element_by_id", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            fallible(caller, "get_element_by_id", |g| {
                let wanted = text(g, ptr, len)?;
                let found = g.state().document.get_element_by_id(&wanted)?;
                Ok(maybe_node(g, found))
            })
        })?
        .func_raw("query_selector", |caller: Caller<'_, BridgeState>, scope: i32, ptr: i32, len: i32| {
            fallible(caller, "query_selector", |g| {
                let scope = node(g, scope)?;
                let selector = text(g, ptr, len)?;
                let found = g.state().document.query_selector(scope, &selector)?;
                Ok(maybe_node(g, found))
            })
        })?
        .func_raw("parent_node", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "parent_node", |g| {
                let found = g.state().document.parent(node(g, h)?)?;
                Ok(maybe_node(g, found))
            })
        })?
        .func_raw("first_child", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "first_child", |g| {
                let found = g.state().document.first_child(node(g, h)?)?;
                Ok(maybe_node(g, found))
            })
        })?
        .func_raw("next_sibling", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "next_sibling", |g| {
                let found = g.state().document.next_sibling(node(g, h)?)?;
                Ok(maybe_node(g, found))
            })
        })?
        .func_raw("previous_sibling", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "previous_sibling", |g| {
                let found = g.state().document.previous_sibling(node(g, h)?)?;
                Ok(maybe_node(g, found))
            })
        })?
        .func_raw("child_count", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "child_count", |g| {
                count(g.state().document.child_count(node(g, h)?)?)
            })
        })?
        .func_raw(
            "add_event_listener",
            |caller: Caller<'_, BridgeState>, h: i32, t_ptr: i32, t_len: i32, closure: i32| {
                fallible(caller, "add_event_listener", |g| {
                    let id = node(g, h)?;
                    let event_type = text(g, t_ptr, t_len)?;
                    let closure = g.state().value(Handle::from_abi(closure))?.expect_closure()?;
                    g.state_mut().document.add_listener(id, &event_type, closure)
                })
            },
        )?
        .func_raw(
            "remove_event_listener",
            |caller: Caller<'_, BridgeState>, h: i32, t_ptr: i32, t_len: i32, closure: i32| {
                fallible(caller, "remove_event_listener", |g| {
                    let id = node(g, h)?;
                    let event_type = text(g, t_ptr, t_len)?;
                    let closure = g.state().value(Handle::from_abi(closure))?.expect_closure()?;
                    g.state_mut().document.remove_listener(id, &event_type, closure)
                })
            },
        )?
        .func_raw("dispatch_event", |caller: Caller<'_, BridgeState>, h: i32, t_ptr: i32, t_len: i32| {
            fallible(caller, "dispatch_event", |g| {
                let target = node(g, h)?;
                let event_type = text(g, t_ptr, t_len)?;
                Ok(flag(event_loop::dispatch_dom_event(g, target, &event_type)?))
            })
        })?
        .func_raw("event_type", |caller: Caller<'_, BridgeState>, out: i32, ev: i32| {
            fallible(caller, "event_type", |g| {
                let event_type = g.state().event(Handle::from_abi(ev))?.event_type.clone();
                g.return_string(out as u32, &event_type)
            })
        })?
        .func_raw("event_target", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "event_target", |g| {
                let target = g.state().event(Handle::from_abi(ev))?.target.clone();
                Ok(g.state_mut().alloc_opt(target).to_abi())
            })
        })?
        .func_raw("event_current_target", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "event_current_target", |g| {
                let current = g.state().event(Handle::from_abi(ev))?.current_target.clone();
                Ok(g.state_mut().alloc_opt(current).to_abi())
            })
        })?
        .func_raw("event_path_len", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "event_path_len", |g| {
                count(g.state().event(Handle::from_abi(ev))?.path.len())
            })
        })?
        .func_raw("event_path_at", |caller: Caller<'_, BridgeState>, ev: i32, index: i32| {
            infallible(caller, "event_path_at", |g| {
                let event = g.state().event(Handle::from_abi(ev))?;
                let entry = usize::try_from(index).ok().and_then(|i| event.path.get(i).cloned());
                Ok(g.state_mut().alloc_opt(entry).to_abi())
            })
        })?
        .func_raw("stop_propagation", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "stop_propagation", |g| {
                g.state_mut().event_mut(Handle::from_abi(ev))?.stop_propagation();
                Ok(())
            })
        })?
        .func_raw("stop_immediate_propagation", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "stop_immediate_propagation", |g| {
                g.state_mut()
                    .event_mut(Handle::from_abi(ev))?
                    .stop_immediate_propagation();
                Ok(())
            })
        })?
        .func_raw("prevent_default", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "prevent_default", |g| {
                g.state_mut().event_mut(Handle::from_abi(ev))?.prevent_default();
                Ok(())
            })
        })?
        .func_raw("default_prevented", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "default_prevented", |g| {
                Ok(flag(g.state().event(Handle::from_abi(ev))?.default_prevented))
            })
        })?;
    Ok(())
}
