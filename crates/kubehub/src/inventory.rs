use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{Api, ListParams},
    Client, Resource,
};
use rollwatch_core::Inventory;

/// Lists node and pod UIDs straight from the API server.
#[derive(Clone)]
pub struct KubeInventory {
    client: Client,
}

impl KubeInventory {
    pub fn new(client: Client) -> Self { Self { client } }
}

async fn uids<K>(api: Api<K>) -> anyhow::Result<Vec<String>>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let list = api.list(&ListParams::default()).await?;
    Ok(list.items.iter().filter_map(|o| o.meta().uid.clone()).collect())
}

#[async_trait]
impl Inventory for KubeInventory {
    async fn node_uids(&self) -> anyhow::Result<Vec<String>> { uids(Api::<Node>::all(self.client.clone())).await }
    async fn pod_uids(&self) -> anyhow::Result<Vec<String>> { uids(Api::<Pod>::all(self.client.clone())).await }
}
