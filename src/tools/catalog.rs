//! Static catalog of tool groups.
//!
//! `core` (mailbox) and `meta` (group management) are always loaded. Every
//! other group starts unloaded and comes in through `load_tools`, a keyword
//! match on an incoming message, or the enabled-groups setting.

use serde_json::{json, Value};

use super::groups::ToolGroup;
use super::ToolDescriptor;

pub const CORE_GROUP: &str = "core";
pub const META_GROUP: &str = "meta";

fn tool(name: &str, description: &str, properties: Value, required: &[&str]) -> ToolDescriptor {
    ToolDescriptor::new(
        name,
        description,
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    )
}

fn no_args(name: &str, description: &str) -> ToolDescriptor {
    tool(name, description, json!({}), &[])
}

fn confirmed_prop() -> Value {
    json!({
        "type": "boolean",
        "description": "Must be true to perform this destructive action"
    })
}

/// All groups, in listing order.
pub fn default_groups() -> Vec<ToolGroup> {
    vec![
        core_group(),
        meta_group(),
        screen_group(),
        memory_group(),
        browser_group(),
        n8n_group(),
        voice_clone_group(),
        diagnostic_group(),
    ]
}

fn core_group() -> ToolGroup {
    ToolGroup::new(CORE_GROUP, "Voice mailbox: send, read, listen and presence")
        .always_loaded()
        .with_tools(vec![
            tool(
                "voice_send",
                "Send a message to another instance through the mailbox",
                json!({
                    "instance_id": {"type": "string", "description": "Your instance id"},
                    "message": {"type": "string", "description": "Message text"},
                    "thread_id": {"type": "string", "description": "Conversation thread"},
                    "reply_to": {"type": "string", "description": "Id of the message being answered"},
                    "image_path": {"type": "string", "description": "Image file to attach"}
                }),
                &["instance_id", "message"],
            ),
            tool(
                "voice_inbox",
                "Read recent messages addressed to this instance",
                json!({
                    "instance_id": {"type": "string"},
                    "limit": {"type": "integer", "description": "Max messages (default 10)"},
                    "include_read": {"type": "boolean"},
                    "mark_as_read": {"type": "boolean"}
                }),
                &["instance_id"],
            ),
            tool(
                "voice_listen",
                "Wait for a new message from a specific sender",
                json!({
                    "instance_id": {"type": "string"},
                    "from_sender": {"type": "string", "description": "Sender to wait for"},
                    "thread_id": {"type": "string"},
                    "timeout_seconds": {"type": "integer", "description": "Max wait, up to 600"}
                }),
                &["instance_id", "from_sender"],
            ),
            tool(
                "voice_status",
                "Update or list instance presence",
                json!({
                    "instance_id": {"type": "string"},
                    "action": {"type": "string", "enum": ["update", "list"]},
                    "status": {"type": "string", "enum": ["active", "idle"]},
                    "current_task": {"type": "string"}
                }),
                &[],
            ),
        ])
}

fn meta_group() -> ToolGroup {
    ToolGroup::new(META_GROUP, "Load, unload and list tool groups")
        .always_loaded()
        .with_tools(vec![
            tool(
                "load_tools",
                "Load a tool group into context",
                json!({"group": {"type": "string"}}),
                &["group"],
            ),
            tool(
                "unload_tools",
                "Remove a tool group from context",
                json!({"group": {"type": "string"}}),
                &["group"],
            ),
            no_args("list_tool_groups", "List tool groups and whether they are loaded"),
        ])
}

fn screen_group() -> ToolGroup {
    ToolGroup::new("screen", "Capture the user's screen")
        .with_keywords(&["screen", "screenshot", "what do you see", "look at this"])
        .with_tools(vec![tool(
            "capture_screen",
            "Take a screenshot of a display",
            json!({"display": {"type": "integer", "description": "Display index"}}),
            &[],
        )])
}

fn memory_group() -> ToolGroup {
    ToolGroup::new("memory", "Long-term memory: search, store and forget facts")
        .with_keywords(&["remember", "memory", "memories", "recall", "forget"])
        .with_tools(vec![
            tool(
                "memory_search",
                "Search stored memories",
                json!({"query": {"type": "string"}, "max_results": {"type": "integer"}}),
                &["query"],
            ),
            tool(
                "memory_get",
                "Read a memory file or chunk",
                json!({"path": {"type": "string"}}),
                &["path"],
            ),
            tool(
                "memory_remember",
                "Store a fact",
                json!({
                    "content": {"type": "string"},
                    "tier": {"type": "string", "enum": ["core", "stable", "notes"]}
                }),
                &["content"],
            ),
            tool(
                "memory_forget",
                "Delete a stored memory",
                json!({"content_or_id": {"type": "string"}, "confirmed": confirmed_prop()}),
                &["content_or_id"],
            )
            .destructive(),
            no_args("memory_stats", "Memory index statistics"),
            tool(
                "memory_flush",
                "Persist notes before context compaction",
                json!({"summary": {"type": "string"}}),
                &[],
            ),
        ])
}

fn browser_group() -> ToolGroup {
    let target = || json!({"tab_id": {"type": "string"}});
    ToolGroup::new("browser", "Control the embedded browser")
        .with_keywords(&[
            "browse",
            "browser",
            "website",
            "web page",
            "webpage",
            "search the web",
            "look up",
            "url",
        ])
        .depends_on(&["screen"])
        .with_tools(vec![
            no_args("browser_start", "Start the browser"),
            no_args("browser_stop", "Stop the browser"),
            no_args("browser_status", "Browser status"),
            no_args("browser_tabs", "List open tabs"),
            tool(
                "browser_open",
                "Open a URL in a new tab",
                json!({"url": {"type": "string"}}),
                &["url"],
            ),
            tool("browser_close_tab", "Close a tab", target(), &["tab_id"]),
            tool("browser_focus", "Focus a tab", target(), &["tab_id"]),
            tool(
                "browser_navigate",
                "Navigate the current tab",
                json!({"url": {"type": "string"}}),
                &["url"],
            ),
            tool("browser_screenshot", "Screenshot the page", target(), &[]),
            tool("browser_snapshot", "Accessibility snapshot of the page", target(), &[]),
            tool(
                "browser_act",
                "Click, type or press keys on the page",
                json!({
                    "kind": {"type": "string", "enum": ["click", "type", "press", "hover", "scroll"]},
                    "ref": {"type": "string"},
                    "text": {"type": "string"}
                }),
                &["kind"],
            ),
            tool("browser_console", "Read console output", target(), &[]),
            tool(
                "browser_search",
                "Search the web",
                json!({"query": {"type": "string"}, "max_results": {"type": "integer"}}),
                &["query"],
            ),
            tool(
                "browser_fetch",
                "Fetch a URL and return readable text",
                json!({"url": {"type": "string"}}),
                &["url"],
            ),
            tool(
                "browser_cookies",
                "Read or clear cookies",
                json!({"action": {"type": "string", "enum": ["list", "clear"]}, "confirmed": confirmed_prop()}),
                &[],
            ),
            tool(
                "browser_storage",
                "Read or clear page storage",
                json!({"action": {"type": "string", "enum": ["get", "clear"]}, "confirmed": confirmed_prop()}),
                &[],
            ),
        ])
}

fn n8n_group() -> ToolGroup {
    let id = || json!({"id": {"type": "string"}});
    let id_confirmed = || json!({"id": {"type": "string"}, "confirmed": confirmed_prop()});
    ToolGroup::new("n8n", "n8n workflow automation")
        .with_keywords(&["n8n", "workflow", "automation"])
        .with_tools(vec![
            tool(
                "n8n_list_workflows",
                "List workflows",
                json!({"active_only": {"type": "boolean"}}),
                &[],
            ),
            tool("n8n_get_workflow", "Get a workflow", id(), &["id"]),
            tool(
                "n8n_create_workflow",
                "Create a workflow",
                json!({"name": {"type": "string"}, "nodes": {"type": "array"}, "connections": {"type": "object"}}),
                &["name"],
            ),
            tool(
                "n8n_update_workflow",
                "Update a workflow",
                json!({"id": {"type": "string"}, "workflow": {"type": "object"}}),
                &["id"],
            ),
            tool("n8n_delete_workflow", "Delete a workflow", id_confirmed(), &["id"]).destructive(),
            tool(
                "n8n_validate_workflow",
                "Validate a workflow definition",
                json!({"workflow": {"type": "object"}}),
                &["workflow"],
            ),
            tool(
                "n8n_trigger_workflow",
                "Trigger a workflow webhook",
                json!({"id": {"type": "string"}, "data": {"type": "object"}}),
                &["id"],
            ),
            tool(
                "n8n_deploy_template",
                "Deploy a workflow template",
                json!({"template_id": {"type": "string"}}),
                &["template_id"],
            ),
            tool(
                "n8n_get_executions",
                "List executions",
                json!({"workflow_id": {"type": "string"}, "status": {"type": "string"}}),
                &[],
            ),
            tool("n8n_get_execution", "Get an execution", id(), &["id"]),
            tool("n8n_delete_execution", "Delete an execution", id_confirmed(), &["id"]).destructive(),
            tool("n8n_retry_execution", "Retry a failed execution", id(), &["id"]),
            no_args("n8n_list_credentials", "List credentials"),
            tool(
                "n8n_create_credential",
                "Create a credential",
                json!({"name": {"type": "string"}, "type": {"type": "string"}, "data": {"type": "object"}}),
                &["name", "type"],
            ),
            tool("n8n_delete_credential", "Delete a credential", id_confirmed(), &["id"]).destructive(),
            tool(
                "n8n_get_credential_schema",
                "Get the schema of a credential type",
                json!({"credential_type": {"type": "string"}}),
                &["credential_type"],
            ),
            tool(
                "n8n_search_nodes",
                "Search available node types",
                json!({"query": {"type": "string"}}),
                &["query"],
            ),
            tool(
                "n8n_get_node",
                "Get a node type definition",
                json!({"node_type": {"type": "string"}}),
                &["node_type"],
            ),
            no_args("n8n_list_tags", "List tags"),
            tool(
                "n8n_create_tag",
                "Create a tag",
                json!({"name": {"type": "string"}}),
                &["name"],
            ),
            tool("n8n_delete_tag", "Delete a tag", id_confirmed(), &["id"]).destructive(),
            no_args("n8n_list_variables", "List variables"),
        ])
}

fn voice_clone_group() -> ToolGroup {
    ToolGroup::new("voice-clone", "Clone a voice from an audio sample")
        .with_keywords(&["clone voice", "voice clone", "clone my voice", "sound like"])
        .with_tools(vec![
            tool(
                "clone_voice",
                "Create a voice clone from an audio file or URL",
                json!({"audio_source": {"type": "string"}, "voice_name": {"type": "string"}}),
                &["audio_source"],
            ),
            tool(
                "clear_voice_clone",
                "Go back to the default voice",
                json!({"confirmed": confirmed_prop()}),
                &[],
            )
            .destructive(),
            no_args("list_voice_clones", "List saved voice clones"),
        ])
}

fn diagnostic_group() -> ToolGroup {
    ToolGroup::new("diagnostic", "Trace a message through the voice pipeline")
        .with_keywords(&["diagnostic", "pipeline trace", "debug the pipeline"])
        .with_tools(vec![tool(
            "pipeline_trace",
            "Send a test message and report each pipeline stage",
            json!({"message": {"type": "string"}, "timeout_seconds": {"type": "integer"}}),
            &[],
        )])
}
