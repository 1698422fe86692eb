use std::collections::HashMap;

use bytes::Bytes;

use crate::network::packet::QoS;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Multi-level wildcard must be on tail")]
    MultiLevelWildcardNotTail,
    #[error("Wildcard must not be adjacent to name")]
    AdjacentWildcard,
}

pub(crate) type NodeId = usize;

/// 主题树
/// 每一层路径片段对应一个节点，节点上挂着订阅者与保留消息
/// 节点按需创建，创建后不再删除
///
/// 所有节点放在一个 Vec 里、以下标互相引用，
/// 这样解析通配符时可以一次返回多个可变节点
pub(crate) struct TopicTree {
    nodes: Vec<TopicNode>,
}

/// 保留消息
#[derive(Debug, Clone)]
pub(crate) struct Retained {
    pub qos: QoS,
    pub payload: Bytes,
}

pub(crate) struct TopicNode {
    /// 从根到当前节点的完整路径，投递保留消息时用
    full_path: String,
    /// 子节点，key = 路径片段
    children: HashMap<String, NodeId>,
    /// 订阅者，key = client_id, value = 订阅时请求的 QoS
    subscribers: HashMap<String, QoS>,
    retained: Option<Retained>,
}

impl TopicNode {
    fn new(full_path: String) -> Self {
        Self {
            full_path,
            children: HashMap::new(),
            subscribers: HashMap::new(),
            retained: None,
        }
    }

    pub(crate) fn full_path(&self) -> &str {
        &self.full_path
    }

    pub(crate) fn subscribers(&self) -> &HashMap<String, QoS> {
        &self.subscribers
    }

    pub(crate) fn retained(&self) -> Option<&Retained> {
        self.retained.as_ref()
    }
}

impl TopicTree {
    pub(crate) fn new() -> Self {
        Self {
            // nodes[0] 为根节点
            nodes: vec![TopicNode::new(String::new())],
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &TopicNode {
        &self.nodes[id]
    }

    /// 解析 topic 或 filter 到它指向的节点集合
    ///
    /// * 具体片段：下行；create 为真时按需创建
    /// * `+`：展开当前节点下所有已存在的子节点（`$` 开头的除外），
    ///   对每个子节点继续解析剩余片段，结果取并集；通配符不创建节点
    /// * `#`：只允许出现在末尾，匹配当前节点与其所有子孙
    ///
    /// 整个 filter 先做校验再下行，校验失败时树不发生任何变化
    pub(crate) fn resolve(&mut self, path: &str, create: bool) -> Result<Vec<NodeId>, Error> {
        let segments: Vec<&str> = path.split('/').collect();
        validate_filter(&segments)?;

        let mut out = Vec::new();
        self.resolve_at(0, &segments, create, &mut out);
        Ok(out)
    }

    fn resolve_at(&mut self, node: NodeId, segments: &[&str], create: bool, out: &mut Vec<NodeId>) {
        let Some((segment, rest)) = segments.split_first() else {
            out.push(node);
            return;
        };

        match *segment {
            "+" => {
                // $ 开头的子节点不参与通配
                let children: Vec<NodeId> = self.nodes[node]
                    .children
                    .iter()
                    .filter(|(key, _)| !key.starts_with('$'))
                    .map(|(_, &id)| id)
                    .collect();
                if rest.is_empty() {
                    out.extend(children);
                } else {
                    for child in children {
                        self.resolve_at(child, rest, create, out);
                    }
                }
            }
            "#" => self.collect_subtree(node, out),
            segment => {
                let child = match self.nodes[node].children.get(segment) {
                    Some(&id) => id,
                    None if create => self.add_child(node, segment),
                    None => return,
                };
                self.resolve_at(child, rest, create, out);
            }
        }
    }

    /// `#` 匹配当前节点与其所有子孙，前序收集
    fn collect_subtree(&self, node: NodeId, out: &mut Vec<NodeId>) {
        out.push(node);
        let children: Vec<NodeId> = self.nodes[node]
            .children
            .iter()
            .filter(|(key, _)| !key.starts_with('$'))
            .map(|(_, &id)| id)
            .collect();
        for child in children {
            self.collect_subtree(child, out);
        }
    }

    fn add_child(&mut self, parent: NodeId, segment: &str) -> NodeId {
        let full_path = if self.nodes[parent].full_path.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{}", self.nodes[parent].full_path, segment)
        };

        let id = self.nodes.len();
        self.nodes.push(TopicNode::new(full_path));
        self.nodes[parent].children.insert(segment.into(), id);
        id
    }

    /// 记录订阅，返回匹配到的节点供调用方投递保留消息
    /// 重复订阅覆盖原来的 QoS
    pub(crate) fn apply_subscriber(
        &mut self,
        client_id: &str,
        filter: &str,
        qos: QoS,
    ) -> Result<Vec<NodeId>, Error> {
        let nodes = self.resolve(filter, true)?;
        for &id in &nodes {
            self.nodes[id].subscribers.insert(client_id.into(), qos);
        }
        Ok(nodes)
    }

    /// 删除订阅，未订阅过的节点无事发生
    pub(crate) fn delete_subscriber(&mut self, client_id: &str, filter: &str) -> Result<(), Error> {
        for id in self.resolve(filter, false)? {
            self.nodes[id].subscribers.remove(client_id);
        }
        Ok(())
    }

    /// 覆盖保留消息，空负载表示清除
    pub(crate) fn apply_retain(
        &mut self,
        topic: &str,
        qos: QoS,
        payload: Bytes,
    ) -> Result<(), Error> {
        for id in self.resolve(topic, true)? {
            self.nodes[id].retained = if payload.is_empty() {
                None
            } else {
                Some(Retained {
                    qos,
                    payload: payload.clone(),
                })
            };
        }
        Ok(())
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

fn validate_filter(segments: &[&str]) -> Result<(), Error> {
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "#" if i != last => return Err(Error::MultiLevelWildcardNotTail),
            "#" | "+" => {}
            s if s.contains('#') || s.contains('+') => return Err(Error::AdjacentWildcard),
            _ => {}
        }
    }
    Ok(())
}
