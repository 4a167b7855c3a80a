// 死锁检测
//
// - 等待图（Wait-for Graph）：等待者 -> 持有者
// - 深度优先搜索（DFS）环检测
// - 受害者为发起等待、闭合环路的请求者

use super::LockOwner;
use std::collections::{HashMap, HashSet, VecDeque};

/// 死锁检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlockInfo {
    /// 环中的锁所有者
    pub involved_owners: Vec<LockOwner>,
    /// 检测时间（毫秒时间戳）
    pub detected_at: i64,
    /// 环长度
    pub cycle_length: usize,
}

impl DeadlockInfo {
    pub fn new(involved_owners: Vec<LockOwner>) -> Self {
        let cycle_length = involved_owners.len();
        Self {
            involved_owners,
            detected_at: chrono::Utc::now().timestamp_millis(),
            cycle_length,
        }
    }

    /// 受害者：闭合环路的请求者（环的起点）
    pub fn victim(&self) -> Option<LockOwner> {
        self.involved_owners.first().copied()
    }
}

/// 等待图
#[derive(Debug, Clone, Default)]
pub struct WaitGraph {
    /// 邻接表：等待者 -> 它等待的持有者
    adjacency: HashMap<LockOwner, Vec<LockOwner>>,
}

impl WaitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置等待者当前等待的持有者集合
    pub fn set_waits(&mut self, waiter: LockOwner, holders: Vec<LockOwner>) {
        self.adjacency.insert(waiter, holders);
    }

    /// 等待者不再等待
    pub fn clear_waits(&mut self, waiter: LockOwner) {
        self.adjacency.remove(&waiter);
    }

    /// 查找经过 `start` 的环
    pub fn cycle_through(&self, start: LockOwner) -> Option<Vec<LockOwner>> {
        let mut visited = HashSet::new();
        let mut path = vec![start];
        if self.dfs(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(
        &self,
        start: LockOwner,
        node: LockOwner,
        visited: &mut HashSet<LockOwner>,
        path: &mut Vec<LockOwner>,
    ) -> bool {
        visited.insert(node);
        if let Some(neighbors) = self.adjacency.get(&node) {
            for &next in neighbors {
                if next == start {
                    return true;
                }
                if !visited.contains(&next) {
                    path.push(next);
                    if self.dfs(start, next, visited, path) {
                        return true;
                    }
                    path.pop();
                }
            }
        }
        false
    }

    pub fn waiting_owners(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(|v| v.len()).sum()
    }
}

/// 死锁检测器
#[derive(Debug)]
pub struct DeadlockDetector {
    wait_graph: WaitGraph,
    history: VecDeque<DeadlockInfo>,
    max_history_size: usize,
    detection_count: u64,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        Self {
            wait_graph: WaitGraph::new(),
            history: VecDeque::with_capacity(32),
            max_history_size: 32,
            detection_count: 0,
        }
    }

    /// 记录一次等待并检测死锁
    pub fn on_wait(&mut self, waiter: LockOwner, holders: Vec<LockOwner>) -> Option<DeadlockInfo> {
        self.wait_graph.set_waits(waiter, holders);
        self.detection_count += 1;

        let cycle = self.wait_graph.cycle_through(waiter)?;
        let info = DeadlockInfo::new(cycle);
        if self.history.len() >= self.max_history_size {
            self.history.pop_front();
        }
        self.history.push_back(info.clone());
        Some(info)
    }

    pub fn on_wait_end(&mut self, waiter: LockOwner) {
        self.wait_graph.clear_waits(waiter);
    }

    pub fn history(&self) -> Vec<DeadlockInfo> {
        self.history.iter().cloned().collect()
    }

    pub fn stats(&self) -> DeadlockStats {
        DeadlockStats {
            detection_count: self.detection_count,
            deadlocks_detected: self.history.len(),
            waiting_owners: self.wait_graph.waiting_owners(),
            edge_count: self.wait_graph.edge_count(),
        }
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// 死锁统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeadlockStats {
    /// 总检测次数
    pub detection_count: u64,
    /// 历史中记录的死锁数
    pub deadlocks_detected: usize,
    /// 当前等待中的所有者
    pub waiting_owners: usize,
    /// 等待边数量
    pub edge_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle() {
        let mut graph = WaitGraph::new();
        graph.set_waits(1, vec![2]);
        graph.set_waits(2, vec![3]);
        assert!(graph.cycle_through(1).is_none());
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_simple_cycle() {
        let mut graph = WaitGraph::new();
        graph.set_waits(1, vec![2]);
        graph.set_waits(2, vec![1]);
        assert_eq!(graph.cycle_through(1), Some(vec![1, 2]));
    }

    #[test]
    fn test_cycle_through_branch() {
        let mut graph = WaitGraph::new();
        graph.set_waits(1, vec![5, 2]);
        graph.set_waits(2, vec![3]);
        graph.set_waits(3, vec![1]);
        assert_eq!(graph.cycle_through(1), Some(vec![1, 2, 3]));
        // 不经过 4 的环不算
        graph.set_waits(4, vec![1]);
        assert!(graph.cycle_through(4).is_none());
    }

    #[test]
    fn test_detector_history() {
        let mut detector = DeadlockDetector::new();
        assert!(detector.on_wait(1, vec![2]).is_none());
        let info = detector.on_wait(2, vec![1]).unwrap();
        assert_eq!(info.victim(), Some(2));
        assert_eq!(info.cycle_length, 2);
        detector.on_wait_end(2);
        let stats = detector.stats();
        assert_eq!(stats.detection_count, 2);
        assert_eq!(stats.deadlocks_detected, 1);
        assert_eq!(stats.waiting_owners, 1);
        assert_eq!(detector.history().len(), 1);
    }
}
