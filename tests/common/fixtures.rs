// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Config and row builders.

use change_router::config::{
    ChannelConfig, NodeConfig, RouterConfig, RouterDefinition, RouterKind, TableRouteConfig,
};
use change_router::{Batch, ChangeRow, EventKind};

/// Local node `corp`, channel `sales` (batch size `batch_size`), nodes A and
/// B subscribed, table `orders` on the default router.
pub fn sales_config(batch_size: usize) -> RouterConfig {
    let mut config = RouterConfig::for_testing("corp");
    config.channels.push(ChannelConfig::for_testing("sales", batch_size));
    config.nodes.push(NodeConfig::for_testing("A", &["sales"]));
    config.nodes.push(NodeConfig::for_testing("B", &["sales"]));
    config
        .table_routes
        .push(TableRouteConfig::for_testing("orders", "sales", "default"));
    config
}

/// Route `table` on `channel` through a column router with `expression`.
pub fn with_column_router(config: &mut RouterConfig, table: &str, channel: &str, expression: &str) {
    let name = format!("{}_column", table);
    config.routers.push(RouterDefinition {
        name: name.clone(),
        kind: RouterKind::Column,
        expression: Some(expression.to_string()),
        lookup: None,
    });
    config.table_routes.retain(|r| !(r.table_name == table && r.channel_id == channel));
    config
        .table_routes
        .push(TableRouteConfig::for_testing(table, channel, &name));
}

/// Add a channel with its own table and subscribers.
pub fn add_channel(config: &mut RouterConfig, channel: &str, table: &str, batch_size: usize) {
    config.channels.push(ChannelConfig::for_testing(channel, batch_size));
    for node in config.nodes.iter_mut() {
        node.channels.push(channel.to_string());
    }
    config
        .table_routes
        .push(TableRouteConfig::for_testing(table, channel, "default"));
}

pub fn order(id: u64) -> ChangeRow {
    ChangeRow::new(id, "orders", "sales", EventKind::Insert).with_column("id", &id.to_string())
}

pub fn row_on(id: u64, table: &str, channel: &str) -> ChangeRow {
    ChangeRow::new(id, table, channel, EventKind::Insert).with_column("id", &id.to_string())
}

/// Batches for one node, in id order.
pub fn for_node<'a>(batches: &'a [Batch], node_id: &str) -> Vec<&'a Batch> {
    let mut mine: Vec<&Batch> = batches.iter().filter(|b| b.node_id == node_id).collect();
    mine.sort_by_key(|b| b.batch_id);
    mine
}

/// All row ids delivered to a node, in delivery order.
pub fn delivered_ids(batches: &[Batch], node_id: &str) -> Vec<u64> {
    for_node(batches, node_id)
        .into_iter()
        .flat_map(|b| b.data_ids())
        .collect()
}
