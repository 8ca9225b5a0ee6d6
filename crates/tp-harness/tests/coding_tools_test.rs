use serde_json::json;
use tp_core::config::AgentLoopConfig;
use tp_harness::tools::{coding_tools, ToolContext};

#[tokio::test]
async fn write_edit_read_search_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ToolContext::new(dir.path(), &AgentLoopConfig::default());
    let tools = coding_tools();

    let wrote = tools
        .execute(
            "write_file",
            json!({"path": "src/lib.rs", "content": "pub fn answer() -> u32 {\n    41\n}\n"}),
            &ctx,
        )
        .await;
    assert!(!wrote.is_error, "{}", wrote.content);

    let edited = tools
        .execute(
            "edit_file",
            json!({"path": "src/lib.rs", "old_string": "41", "new_string": "42"}),
            &ctx,
        )
        .await;
    assert!(!edited.is_error, "{}", edited.content);

    let read = tools
        .execute("read_file", json!({"path": "src/lib.rs"}), &ctx)
        .await;
    assert!(read.content.contains("     2\t    42"));

    let found = tools
        .execute(
            "grep",
            json!({"pattern": "fn answer", "output_mode": "content"}),
            &ctx,
        )
        .await;
    assert_eq!(found.content, "src/lib.rs:1:pub fn answer() -> u32 {");

    let listed = tools.execute("glob", json!({"pattern": "**/*.rs"}), &ctx).await;
    assert_eq!(listed.content, "src/lib.rs");

    let ran = tools
        .execute("bash", json!({"command": "cat src/lib.rs | wc -l"}), &ctx)
        .await;
    assert_eq!(ran.content.trim(), "3");
}

#[tokio::test]
async fn errors_come_back_as_results() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ToolContext::new(dir.path(), &AgentLoopConfig::default());
    let tools = coding_tools();

    let escaped = tools
        .execute("write_file", json!({"path": "../evil.txt", "content": "x"}), &ctx)
        .await;
    assert!(escaped.is_error);
    assert!(escaped.content.contains("outside the working directory"));
    assert!(!dir.path().parent().unwrap().join("evil.txt").exists());

    let missing_arg = tools.execute("read_file", json!({}), &ctx).await;
    assert!(missing_arg.is_error);
    assert!(missing_arg.content.contains("missing required parameter: path"));

    let missing_file = tools
        .execute("read_file", json!({"path": "nope.txt"}), &ctx)
        .await;
    assert!(missing_file.is_error);
}
