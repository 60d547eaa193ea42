// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use agent_registry::signal::handle_signals;
use agent_registry::{agent_registry_store_path, init_web_server, FileStore};
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGTERM;
use signal_hook_async_std::Signals;

/// Run a web server that maintains the mapping from agent identifiers to
/// verification keys.
#[async_std::main]
async fn main() -> Result<(), std::io::Error> {
    tracing_subscriber::fmt().pretty().init();

    let signals = Signals::new([SIGINT, SIGTERM]).unwrap();
    let handle = signals.handle();
    let signals_task = async_std::task::spawn(handle_signals(signals));

    let store_path = agent_registry_store_path();
    std::fs::create_dir_all(&store_path)?;
    let store = FileStore::new(store_path);

    init_web_server(store)
        .await
        .unwrap_or_else(|err| {
            panic!("Web server exited with an error: {}", err);
        })
        .await?;

    handle.close();
    signals_task.await;

    Ok(())
}
