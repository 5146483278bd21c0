use anyhow::Result;
use serde_json::{Value, json};
use std::sync::Arc;

use workbook_mcp::server::AnalysisServer;
use workbook_mcp::state::compute_file_checksum;

mod support;

fn server(state: Arc<workbook_mcp::state::AppState>) -> Arc<AnalysisServer> {
    Arc::new(AnalysisServer::new(state))
}

#[tokio::test]
async fn analyze_file_round_trips_through_the_rpc_envelope() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = support::sales_workbook(&workspace, "ventes.xlsx");

    let server = server(support::app_state());
    let request = json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "analyze_file",
        "params": { "filepath": path.to_string_lossy(), "chunk_size": 10 },
    });

    let response = server.handle_line(&request.to_string()).await;
    assert!(response.error.is_none());
    assert_eq!(response.id, json!(7));

    let result = response.result.expect("result");
    assert_eq!(
        result["metadata"]["checksum"],
        json!(compute_file_checksum(&path)?)
    );
    assert_eq!(result["metadata"]["sheets_count"], json!(1));
    assert_eq!(result["has_more"], json!(false));
    Ok(())
}

#[tokio::test]
async fn missing_file_surfaces_an_io_error_not_a_crash() -> Result<()> {
    let server = server(support::app_state());
    let request = json!({
        "jsonrpc": "2.0",
        "id": 8,
        "method": "analyze_file",
        "params": { "filepath": "/nonexistent/livre.xlsm" },
    });

    let response = server.handle_line(&request.to_string()).await;
    let error = response.error.expect("error");
    assert_eq!(error.code, workbook_mcp::errors::CODE_SERVER_ERROR);
    assert!(error.message.contains("failed to stat"));
    Ok(())
}

#[tokio::test]
async fn full_tool_chain_over_the_envelope() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = support::sales_workbook(&workspace, "ventes.xlsx");
    let filepath = path.to_string_lossy().into_owned();

    let server = server(support::app_state());

    let analyze = server
        .handle_line(
            &json!({
                "jsonrpc": "2.0", "id": 1, "method": "analyze_file",
                "params": { "filepath": filepath },
            })
            .to_string(),
        )
        .await;
    let checksum = analyze.result.expect("analyze result")["metadata"]["checksum"]
        .as_str()
        .expect("checksum")
        .to_string();

    let navigate = server
        .handle_line(
            &json!({
                "jsonrpc": "2.0", "id": 2, "method": "build_navigation_map",
                "params": { "filepath": filepath, "checksum": checksum },
            })
            .to_string(),
        )
        .await;
    let nav_result = navigate.result.expect("navigation result");
    assert_eq!(nav_result["navigation_index"]["checksum_match"], json!(true));

    let query = server
        .handle_line(
            &json!({
                "jsonrpc": "2.0", "id": 3, "method": "query_data",
                "params": {
                    "query": "value >= 1000",
                    "navigation_index": nav_result["navigation_index"],
                    "filepath": filepath,
                },
            })
            .to_string(),
        )
        .await;
    let query_result = query.result.expect("query result");
    assert_eq!(query_result["query_execution"]["index_type"], json!("btree"));
    assert_eq!(query_result["query_execution"]["used_index"], json!(true));

    let locations: Vec<&str> = query_result["results"]["data"]
        .as_array()
        .expect("data")
        .iter()
        .map(|chunk| chunk["location"].as_str().unwrap())
        .collect();
    assert_eq!(locations, vec!["Ventes!B2", "Ventes!B3"]);
    Ok(())
}

#[tokio::test]
async fn http_transport_serves_rpc_health_and_metrics() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = support::sales_workbook(&workspace, "ventes.xlsx");

    let server = server(support::app_state());
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let address = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let serve_task = tokio::spawn(workbook_mcp::http::serve_on(listener, server, async {
        let _ = shutdown_rx.await;
    }));

    let base = format!("http://{address}");
    let client = reqwest::Client::new();

    let rpc: Value = client
        .post(&base)
        .body(
            json!({
                "jsonrpc": "2.0", "id": 1, "method": "analyze_file",
                "params": { "filepath": path.to_string_lossy() },
            })
            .to_string(),
        )
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(rpc["jsonrpc"], json!("2.0"));
    assert_eq!(
        rpc["result"]["metadata"]["checksum"],
        json!(compute_file_checksum(&path)?)
    );

    // Errors stay in the body with HTTP 200.
    let error_response = client
        .post(&base)
        .body(json!({ "jsonrpc": "2.0", "id": 2, "method": "bogus" }).to_string())
        .send()
        .await?;
    assert_eq!(error_response.status(), 200);
    let error_body: Value = error_response.json().await?;
    assert_eq!(error_body["error"]["code"], json!(-32601));

    let health: Value = client.get(format!("{base}/health")).send().await?.json().await?;
    assert_eq!(health["status"], json!("healthy"));
    assert!(health["cache"]["memory_total"].as_u64().unwrap() > 0);

    let metrics: Value = client.get(format!("{base}/metrics")).send().await?.json().await?;
    assert!(metrics["memory_usage"]["total_bytes"].as_u64().unwrap() > 0);
    assert!(metrics["cache_stats"].get("hits").is_some());

    let _ = shutdown_tx.send(());
    let _ = serve_task.await?;
    Ok(())
}
