// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use agent_registry::{agent_registry_port, init_web_server, wait_for_server, TransientFileStore};

#[async_std::test]
async fn test_healthcheck() {
    let store = TransientFileStore::default();
    init_web_server(store).await.expect("Failed to run server.");
    wait_for_server().await;

    let mut response = surf::get(format!(
        "http://127.0.0.1:{}/healthcheck",
        agent_registry_port()
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), surf::StatusCode::Ok);
    let body: serde_json::Value = response.body_json().await.unwrap();
    assert_eq!(body["status"], "available");
}
