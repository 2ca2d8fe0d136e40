//! Node registration and CHAP lookup

use crate::controlplane::context::RequestContext;
use crate::controlplane::orchestrator::Orchestrator;
use crate::error::{Error, Result};
use crate::model::{volume::IscsiChapInfo, Node};
use tracing::info;

impl Orchestrator {
    /// Register or refresh a node, then grant it access on every backend
    pub async fn add_node(&self, ctx: &RequestContext, mut node: Node) -> Result<Node> {
        self.check_ready()?;
        if node.name.trim().is_empty() {
            return Err(Error::InvalidArgument("node name must not be empty".into()));
        }
        // Re-registering a node that was being deleted revives it
        node.deleted = false;
        self.store.add_or_update_node(&node).await?;
        self.catalog.lock().nodes.insert(node.name.clone(), node.clone());
        info!(node = %node.name, "Registered node");

        self.reconcile_all_node_access(ctx).await;
        Ok(node)
    }

    /// Remove a node, or mark it deleted until its last publication goes
    pub async fn delete_node(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        self.check_ready()?;
        let (mut node, published) = {
            let catalog = self.catalog.lock();
            let node = catalog
                .nodes
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found("node", name))?;
            (node, !catalog.publications_for_node(name).is_empty())
        };

        if published {
            node.deleted = true;
            self.store.add_or_update_node(&node).await?;
            self.catalog.lock().nodes.insert(node.name.clone(), node);
            info!(node = %name, "Node still has publications, deletion deferred");
        } else {
            self.remove_node_record(name).await?;
        }

        self.reconcile_all_node_access(ctx).await;
        Ok(())
    }

    pub(crate) async fn remove_node_record(&self, name: &str) -> Result<()> {
        match self.store.delete_node(name).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        self.catalog.lock().nodes.remove(name);
        info!(node = %name, "Removed node");
        Ok(())
    }

    /// CHAP credentials a node uses to log in to a volume's target
    pub async fn get_chap(&self, ctx: &RequestContext, volume_name: &str, node_name: &str) -> Result<IscsiChapInfo> {
        self.check_ready()?;
        let (config, driver) = {
            let catalog = self.catalog.lock();
            let volume = catalog.backing_volume(volume_name)?;
            let driver = catalog
                .backends
                .get(&volume.backend_uuid)
                .ok_or_else(|| Error::not_found("backend", &volume.backend_uuid))?
                .driver()?;
            (volume.config.clone(), driver)
        };
        ctx.call("chap_info", driver.chap_info(&config, node_name)).await
    }
}
