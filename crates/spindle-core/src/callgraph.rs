//! Whole-program call graph and the SCC order the lowering pipeline
//! schedules over.
//!
//! Only direct call edges between functions defined in the module are
//! recorded at build time. Functions reachable solely through stored
//! function pointers (the state-machine clones) are registered after the
//! fact with `update`.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::ident::Name;
use crate::ir::{InstKind, Module, Value};

#[derive(Debug, Default)]
pub struct CallGraph {
    nodes: Vec<Name>,
    callees: HashMap<Name, Vec<Name>>,
}

impl CallGraph {
    pub fn build(module: &Module) -> CallGraph {
        let defined: HashSet<&str> = module.functions.iter().map(|f| f.name.as_str()).collect();
        let mut graph = CallGraph::default();
        for function in &module.functions {
            let callees = function
                .body
                .insts
                .iter()
                .filter_map(|inst| match &inst.kind {
                    InstKind::Call {
                        callee: Value::Function(name),
                        ..
                    } if defined.contains(name.as_str()) => Some(name.clone()),
                    _ => None,
                })
                .unique()
                .collect();
            graph.nodes.push(function.name.clone());
            graph.callees.insert(function.name.clone(), callees);
        }
        graph
    }

    /// Register `new_callees` as reachable from `caller`. Invoked once per
    /// split with zero or exactly three new functions.
    pub fn update(&mut self, caller: &Name, new_callees: &[Name]) {
        for callee in new_callees {
            if !self.callees.contains_key(callee) {
                self.nodes.push(callee.clone());
                self.callees.insert(callee.clone(), Vec::new());
            }
            let edges = self.callees.entry(caller.clone()).or_default();
            if !edges.contains(callee) {
                edges.push(callee.clone());
            }
        }
    }

    pub fn callees(&self, caller: &Name) -> &[Name] {
        self.callees.get(caller).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Strongly connected components, callees before callers.
    pub fn sccs_bottom_up(&self) -> Vec<Vec<Name>> {
        Tarjan::new(self).run()
    }
}

struct Tarjan<'a> {
    graph: &'a CallGraph,
    index: HashMap<&'a Name, u32>,
    lowlink: HashMap<&'a Name, u32>,
    on_stack: HashSet<&'a Name>,
    stack: Vec<&'a Name>,
    next_index: u32,
    sccs: Vec<Vec<Name>>,
}

impl<'a> Tarjan<'a> {
    fn new(graph: &'a CallGraph) -> Self {
        Tarjan {
            graph,
            index: HashMap::new(),
            lowlink: HashMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            next_index: 0,
            sccs: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Vec<Name>> {
        let graph = self.graph;
        for node in &graph.nodes {
            if !self.index.contains_key(node) {
                self.visit(node);
            }
        }
        self.sccs
    }

    fn visit(&mut self, node: &'a Name) {
        self.index.insert(node, self.next_index);
        self.lowlink.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        let graph = self.graph;
        for callee in graph.callees(node) {
            if !self.index.contains_key(callee) {
                self.visit(callee);
                let low = self.lowlink[callee].min(self.lowlink[node]);
                self.lowlink.insert(node, low);
            } else if self.on_stack.contains(callee) {
                let low = self.index[callee].min(self.lowlink[node]);
                self.lowlink.insert(node, low);
            }
        }

        if self.lowlink[node] == self.index[node] {
            let mut component = Vec::new();
            loop {
                let member = self.stack.pop().expect("tarjan stack underflow");
                self.on_stack.remove(member);
                component.push(member.clone());
                if member == node {
                    break;
                }
            }
            self.sccs.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Signature, Terminator, Ty};

    fn caller_of(name: &str, callee: &str) -> Function {
        let mut f = Function::new(
            name,
            Signature {
                params: vec![],
                return_type: Ty::Void,
            },
        );
        f.body.push_inst(
            0,
            InstKind::Call {
                callee: Value::Function(Name::new(callee)),
                args: vec![],
            },
            Ty::Void,
        );
        f.body.block_mut(0).terminator = Terminator::Return(None);
        f
    }

    #[test]
    fn sccs_come_out_bottom_up() {
        let mut module = Module::new();
        module.functions.push(caller_of("main", "ping"));
        module.functions.push(caller_of("ping", "pong"));
        module.functions.push(caller_of("pong", "ping"));

        let graph = CallGraph::build(&module);
        let sccs = graph.sccs_bottom_up();

        assert_eq!(sccs.len(), 2);
        let mut cycle = sccs[0].iter().map(Name::as_str).collect::<Vec<_>>();
        cycle.sort();
        assert_eq!(cycle, vec!["ping", "pong"]);
        assert_eq!(sccs[1], vec![Name::new("main")]);
    }

    #[test]
    fn update_registers_clone_edges() {
        let mut module = Module::new();
        module.functions.push(caller_of("gen", "helper"));
        module.functions.push(caller_of("helper", "helper"));

        let mut graph = CallGraph::build(&module);
        let clones = vec![
            Name::new("gen.resume"),
            Name::new("gen.destroy"),
            Name::new("gen.cleanup"),
        ];
        graph.update(&Name::new("gen"), &clones);

        assert_eq!(graph.callees(&Name::new("gen")).len(), 4);
        assert!(graph.callees(&Name::new("gen")).contains(&Name::new("gen.cleanup")));
    }
}
