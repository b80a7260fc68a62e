//! 工作流依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；用于校验规划器给出的步骤顺序

use std::collections::{HashMap, HashSet, VecDeque};

use crate::workflow::types::*;

/// 工作流依赖图
pub struct WorkflowGraph {
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 前置步骤数
    pub in_degree: HashMap<StepId, usize>,
    /// 声明顺序（用于稳定的拓扑排序）
    order: Vec<StepId>,
}

impl WorkflowGraph {
    /// 创建依赖图；步骤 ID 重复或引用未知步骤时报错
    pub fn new(workflow: &Workflow) -> Result<Self, WorkflowError> {
        if workflow.steps.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();
        let mut order = Vec::with_capacity(workflow.steps.len());

        for step in &workflow.steps {
            if in_degree.insert(step.step_id.clone(), 0).is_some() {
                return Err(WorkflowError::DuplicateStep(step.step_id.clone()));
            }
            adjacency.insert(step.step_id.clone(), Vec::new());
            order.push(step.step_id.clone());
        }

        for (step_id, deps) in &workflow.dependencies {
            if !in_degree.contains_key(step_id) {
                return Err(WorkflowError::UnknownStep(step_id.clone()));
            }
            for dep_id in deps {
                let dependents = adjacency.get_mut(dep_id).ok_or_else(|| {
                    WorkflowError::UnknownDependency {
                        step: step_id.clone(),
                        dependency: dep_id.clone(),
                    }
                })?;
                dependents.push(step_id.clone());
                *in_degree.entry(step_id.clone()).or_insert(0) += 1;
            }
        }

        for step in &workflow.steps {
            for output in step.inputs.values() {
                if !in_degree.contains_key(&output.step_id) {
                    return Err(WorkflowError::UnknownInput {
                        step: step.step_id.clone(),
                        input: output.step_id.clone(),
                    });
                }
            }
        }

        Ok(Self {
            adjacency,
            in_degree,
            order,
        })
    }

    /// 获取可执行的步骤（所有前置步骤都已完成且自身未完成）
    pub fn ready_steps(&self, completed: &HashSet<StepId>) -> Vec<StepId> {
        let mut remaining = self.in_degree.clone();
        for done in completed {
            if let Some(dependents) = self.adjacency.get(done) {
                for dependent in dependents {
                    if let Some(degree) = remaining.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
        }
        self.order
            .iter()
            .filter(|id| !completed.contains(*id) && remaining.get(*id) == Some(&0))
            .cloned()
            .collect()
    }

    /// Kahn 拓扑排序；同一层内保持声明顺序。存在环时返回 CyclicDependency
    pub fn topological_order(&self) -> Result<Vec<StepId>, WorkflowError> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<StepId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(step_id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&step_id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(step_id);
        }

        if sorted.len() != self.order.len() {
            return Err(WorkflowError::CyclicDependency);
        }
        Ok(sorted)
    }

    /// 校验声明顺序：无环，且每个步骤的前置步骤与输入来源都排在它之前
    pub fn check_declared_order(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        self.topological_order()?;

        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        for step in &workflow.steps {
            let pos = position[step.step_id.as_str()];
            let deps = workflow
                .dependencies
                .get(&step.step_id)
                .into_iter()
                .flatten()
                .map(String::as_str);
            let inputs = step.inputs.values().map(|o| o.step_id.as_str());
            for upstream in deps.chain(inputs) {
                if position[upstream] >= pos {
                    return Err(WorkflowError::OutOfOrder {
                        step: step.step_id.clone(),
                        dependency: upstream.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
