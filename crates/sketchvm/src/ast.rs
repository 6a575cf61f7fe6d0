//! Arena-based AST shared by the parser, the CompactAST codec, and the
//! interpreter.
//!
//! Nodes are stored in pre-order: a parent always precedes its children, and
//! the `Program` root is node 0. The interpreter and the codec both refer to
//! nodes by [`NodeId`], never by reference, so the tree is immutable after
//! parsing and cheap to relocate.

use std::fmt::Write as _;

use smallvec::SmallVec;

/// Index of a node in the [`Ast`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("AST node count exceeds u32"))
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Closed node-kind enumeration. Discriminants are the CompactAST `kind`
/// byte, so they are stable and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum NodeKind {
    Program = 0x01,
    ErrorStmt = 0x02,
    CompoundStmt = 0x03,
    ExpressionStmt = 0x04,
    EmptyStmt = 0x05,
    IfStmt = 0x06,
    WhileStmt = 0x07,
    DoWhileStmt = 0x08,
    ForStmt = 0x09,
    RangeForStmt = 0x0A,
    SwitchStmt = 0x0B,
    CaseLabel = 0x0C,
    DefaultLabel = 0x0D,
    BreakStmt = 0x0E,
    ContinueStmt = 0x0F,
    ReturnStmt = 0x10,

    VarDecl = 0x20,
    FuncDef = 0x21,
    FuncDecl = 0x22,
    ParamList = 0x23,
    Param = 0x24,
    TypeName = 0x25,
    ArraySize = 0x26,
    InitializerList = 0x27,
    DesignatedInit = 0x28,
    CtorInit = 0x29,
    StructDecl = 0x2A,
    UnionDecl = 0x2B,
    EnumDecl = 0x2C,
    EnumConstant = 0x2D,
    TypedefDecl = 0x2E,
    FunctionPtrDecl = 0x2F,

    BinaryExpr = 0x40,
    UnaryExpr = 0x41,
    PostfixExpr = 0x42,
    AssignExpr = 0x43,
    TernaryExpr = 0x44,
    CallExpr = 0x45,
    SubscriptExpr = 0x46,
    MemberExpr = 0x47,
    ArrowExpr = 0x48,
    ScopeExpr = 0x49,
    CastExpr = 0x4A,
    FunctionCastExpr = 0x4B,
    StaticCastExpr = 0x4C,
    SizeofExpr = 0x4D,
    SizeofTypeExpr = 0x4E,
    TypeofExpr = 0x4F,
    CommaExpr = 0x50,

    Identifier = 0x60,
    IntLiteral = 0x61,
    FloatLiteral = 0x62,
    CharLiteral = 0x63,
    WideCharLiteral = 0x64,
    StringLiteral = 0x65,
    BoolLiteral = 0x66,
    NullptrLiteral = 0x67,
}

impl NodeKind {
    /// Nodes whose `name` holds an operator symbol rather than an
    /// identifier. The codec stores these with the operator value type.
    #[must_use]
    pub fn is_operator(self) -> bool {
        matches!(
            self,
            Self::BinaryExpr | Self::UnaryExpr | Self::PostfixExpr | Self::AssignExpr
        )
    }
}

/// Node flag bits (CompactAST `flags` byte).
pub mod flags {
    pub const CONST: u8 = 0x01;
    pub const STATIC: u8 = 0x02;
    pub const VOLATILE: u8 = 0x04;
    pub const EXTERN: u8 = 0x08;
    pub const REFERENCE: u8 = 0x10;
    /// Set on subtrees produced by parser error recovery.
    pub const ERROR: u8 = 0x20;
}

/// Literal payload attached to literal nodes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Literal {
    Bool(bool),
    Int {
        value: i64,
        unsigned: bool,
    },
    Float32(f32),
    Float64(f64),
    Str(String),
    /// Unicode code point; `WideCharLiteral` vs `CharLiteral` is the node
    /// kind's job.
    Char(u32),
    Null,
}

/// One AST node. Every node except the root has exactly one parent.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub flags: u8,
    pub line: u32,
    /// Identifier, member, or type name; operator symbol for operator nodes.
    pub name: Option<String>,
    pub value: Option<Literal>,
    pub children: SmallVec<[NodeId; 4]>,
}

/// The AST arena. Node 0 is always the `Program` root.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a childless node and returns its id. The parser reserves the
    /// parent before parsing children, which keeps the arena in pre-order.
    pub fn push(&mut self, kind: NodeKind, line: u32) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        self.nodes.push(Node {
            kind,
            flags: 0,
            line,
            name: None,
            value: None,
            children: SmallVec::new(),
        });
        id
    }

    pub(crate) fn push_node(&mut self, node: Node) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        self.nodes.push(node);
        id
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    #[must_use]
    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.nodes[id.index()].kind
    }

    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    #[must_use]
    pub fn child(&self, id: NodeId, n: usize) -> Option<NodeId> {
        self.children(id).get(n).copied()
    }

    #[must_use]
    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.nodes[id.index()].name.as_deref()
    }

    #[must_use]
    pub fn line(&self, id: NodeId) -> u32 {
        self.nodes[id.index()].line
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId::new(i), n))
    }

    /// Rebuilds the arena in strict pre-order from the root.
    ///
    /// The parser allocates expression nodes bottom-up, so parents can land
    /// after their children; this pass renumbers every reachable node so a
    /// parent always precedes its children (the CompactAST layout) and
    /// drops orphans left behind by error recovery.
    #[must_use]
    pub fn into_preorder(self) -> Self {
        if self.nodes.is_empty() {
            return self;
        }
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            // Children are pushed in reverse so they pop left-to-right.
            for child in self.children(id).iter().rev() {
                stack.push(*child);
            }
        }
        let mut remap = vec![u32::MAX; self.nodes.len()];
        for (new_index, old_id) in order.iter().enumerate() {
            remap[old_id.index()] = new_index as u32;
        }
        let mut nodes = Vec::with_capacity(order.len());
        for old_id in &order {
            let mut node = self.nodes[old_id.index()].clone();
            node.children = node
                .children
                .iter()
                .map(|child| NodeId(remap[child.index()]))
                .collect();
            nodes.push(node);
        }
        Self { nodes }
    }

    /// Structural equality ignoring source lines.
    ///
    /// This is the equivalence used by the reparse-idempotence invariant:
    /// printing and reparsing moves nodes to new lines but must preserve
    /// kinds, flags, names, values, and shape.
    #[must_use]
    pub fn structural_eq(&self, other: &Self) -> bool {
        if self.nodes.len() != other.nodes.len() {
            return false;
        }
        self.structural_eq_at(self.root(), other, other.root())
    }

    fn structural_eq_at(&self, id: NodeId, other: &Self, other_id: NodeId) -> bool {
        let a = self.node(id);
        let b = other.node(other_id);
        if a.kind != b.kind || a.flags != b.flags || a.name != b.name || a.value != b.value {
            return false;
        }
        if a.children.len() != b.children.len() {
            return false;
        }
        a.children
            .iter()
            .zip(b.children.iter())
            .all(|(x, y)| self.structural_eq_at(*x, other, *y))
    }

    /// Renders the tree as compilable source in canonical form.
    ///
    /// Expressions are fully parenthesized so reparsing the output yields a
    /// structurally equal tree.
    #[must_use]
    pub fn render(&self) -> String {
        let mut printer = Printer {
            ast: self,
            out: String::new(),
            indent: 0,
        };
        for child in self.children(self.root()) {
            printer.stmt(*child);
        }
        printer.out
    }
}

struct Printer<'a> {
    ast: &'a Ast,
    out: String,
    indent: usize,
}

impl Printer<'_> {
    fn pad(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
    }

    fn specifiers(&mut self, node_flags: u8) {
        if node_flags & flags::EXTERN != 0 {
            self.out.push_str("extern ");
        }
        if node_flags & flags::STATIC != 0 {
            self.out.push_str("static ");
        }
        if node_flags & flags::CONST != 0 {
            self.out.push_str("const ");
        }
        if node_flags & flags::VOLATILE != 0 {
            self.out.push_str("volatile ");
        }
    }

    fn stmt(&mut self, id: NodeId) {
        let node = self.ast.node(id);
        match node.kind {
            NodeKind::CompoundStmt => {
                self.pad();
                self.out.push_str("{\n");
                self.indent += 1;
                for child in self.ast.children(id) {
                    self.stmt(*child);
                }
                self.indent -= 1;
                self.pad();
                self.out.push_str("}\n");
            }
            NodeKind::ExpressionStmt => {
                self.pad();
                if let Some(expr) = self.ast.child(id, 0) {
                    self.expr(expr);
                }
                self.out.push_str(";\n");
            }
            NodeKind::EmptyStmt | NodeKind::ErrorStmt => {
                self.pad();
                self.out.push_str(";\n");
            }
            NodeKind::IfStmt => {
                self.pad();
                self.out.push_str("if (");
                self.expr(self.ast.children(id)[0]);
                self.out.push_str(")\n");
                self.stmt(self.ast.children(id)[1]);
                if let Some(else_branch) = self.ast.child(id, 2) {
                    self.pad();
                    self.out.push_str("else\n");
                    self.stmt(else_branch);
                }
            }
            NodeKind::WhileStmt => {
                self.pad();
                self.out.push_str("while (");
                self.expr(self.ast.children(id)[0]);
                self.out.push_str(")\n");
                self.stmt(self.ast.children(id)[1]);
            }
            NodeKind::DoWhileStmt => {
                self.pad();
                self.out.push_str("do\n");
                self.stmt(self.ast.children(id)[0]);
                self.pad();
                self.out.push_str("while (");
                self.expr(self.ast.children(id)[1]);
                self.out.push_str(");\n");
            }
            NodeKind::ForStmt => {
                // Children: init-stmt, cond (EmptyStmt when absent), update
                // (EmptyStmt when absent), body.
                self.pad();
                self.out.push_str("for (");
                let children = self.ast.children(id).to_vec();
                match self.ast.kind(children[0]) {
                    NodeKind::EmptyStmt => self.out.push(';'),
                    NodeKind::VarDecl => self.inline_var_decl(children[0]),
                    _ => {
                        if let Some(expr) = self.ast.child(children[0], 0) {
                            self.expr(expr);
                        }
                        self.out.push(';');
                    }
                }
                self.out.push(' ');
                if self.ast.kind(children[1]) != NodeKind::EmptyStmt {
                    self.expr(children[1]);
                }
                self.out.push_str("; ");
                if self.ast.kind(children[2]) != NodeKind::EmptyStmt {
                    self.expr(children[2]);
                }
                self.out.push_str(")\n");
                self.stmt(children[3]);
            }
            NodeKind::RangeForStmt => {
                self.pad();
                self.out.push_str("for (");
                let children = self.ast.children(id).to_vec();
                // Loop variable is a VarDecl without initializer.
                let decl = self.ast.node(children[0]);
                let decl_flags = decl.flags;
                let decl_name = decl.name.clone().unwrap_or_default();
                self.specifiers(decl_flags);
                if let Some(ty) = self.ast.child(children[0], 0) {
                    self.type_name(ty);
                }
                self.out.push(' ');
                if decl_flags & flags::REFERENCE != 0 {
                    self.out.push('&');
                }
                self.out.push_str(&decl_name);
                self.out.push_str(" : ");
                self.expr(children[1]);
                self.out.push_str(")\n");
                self.stmt(children[2]);
            }
            NodeKind::SwitchStmt => {
                self.pad();
                self.out.push_str("switch (");
                self.expr(self.ast.children(id)[0]);
                self.out.push_str(")\n");
                self.stmt(self.ast.children(id)[1]);
            }
            NodeKind::CaseLabel => {
                self.pad();
                self.out.push_str("case ");
                self.expr(self.ast.children(id)[0]);
                self.out.push_str(":\n");
            }
            NodeKind::DefaultLabel => {
                self.pad();
                self.out.push_str("default:\n");
            }
            NodeKind::BreakStmt => {
                self.pad();
                self.out.push_str("break;\n");
            }
            NodeKind::ContinueStmt => {
                self.pad();
                self.out.push_str("continue;\n");
            }
            NodeKind::ReturnStmt => {
                self.pad();
                self.out.push_str("return");
                if let Some(expr) = self.ast.child(id, 0) {
                    self.out.push(' ');
                    self.expr(expr);
                }
                self.out.push_str(";\n");
            }
            NodeKind::VarDecl => {
                self.pad();
                self.inline_var_decl(id);
                self.out.push('\n');
            }
            NodeKind::FunctionPtrDecl => {
                // Children: return type, param list, optional initializer.
                let node_flags = node.flags;
                let name = node.name.clone().unwrap_or_default();
                let children = self.ast.children(id).to_vec();
                self.pad();
                self.specifiers(node_flags);
                self.type_name(children[0]);
                let _ = write!(self.out, " (*{name})(");
                let params = self.ast.children(children[1]).to_vec();
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    if let Some(ty) = self.ast.child(*param, 0) {
                        self.type_name(ty);
                    }
                    let pname = self.ast.name(*param).map(str::to_owned);
                    if let Some(pname) = pname {
                        self.out.push(' ');
                        self.out.push_str(&pname);
                    }
                }
                self.out.push(')');
                if let Some(init) = children.get(2) {
                    self.out.push_str(" = ");
                    self.expr(*init);
                }
                self.out.push_str(";\n");
            }
            NodeKind::FuncDef | NodeKind::FuncDecl => self.function(id),
            NodeKind::StructDecl | NodeKind::UnionDecl => {
                let keyword = if node.kind == NodeKind::StructDecl { "struct" } else { "union" };
                let name = node.name.clone().unwrap_or_default();
                self.pad();
                let _ = write!(self.out, "{keyword} {name} {{\n");
                self.indent += 1;
                for member in self.ast.children(id).to_vec() {
                    self.stmt(member);
                }
                self.indent -= 1;
                self.pad();
                self.out.push_str("};\n");
            }
            NodeKind::EnumDecl => {
                let name = node.name.clone().unwrap_or_default();
                self.pad();
                let _ = write!(self.out, "enum {name} {{\n");
                self.indent += 1;
                let constants = self.ast.children(id).to_vec();
                for (i, constant) in constants.iter().enumerate() {
                    self.pad();
                    let cname = self.ast.name(*constant).unwrap_or_default().to_owned();
                    self.out.push_str(&cname);
                    if let Some(value) = self.ast.child(*constant, 0) {
                        self.out.push_str(" = ");
                        self.expr(value);
                    }
                    if i + 1 < constants.len() {
                        self.out.push(',');
                    }
                    self.out.push('\n');
                }
                self.indent -= 1;
                self.pad();
                self.out.push_str("};\n");
            }
            NodeKind::TypedefDecl => {
                self.pad();
                self.out.push_str("typedef ");
                if let Some(ty) = self.ast.child(id, 0) {
                    self.type_name(ty);
                }
                self.out.push(' ');
                self.out.push_str(self.ast.name(id).unwrap_or_default().to_owned().as_str());
                self.out.push_str(";\n");
            }
            // Expressions at statement position should not occur, but render
            // them defensively rather than panic.
            _ => {
                self.pad();
                self.expr(id);
                self.out.push_str(";\n");
            }
        }
    }

    /// Renders `type name[dims] = init;` without leading padding or trailing
    /// newline, for reuse inside `for` headers.
    fn inline_var_decl(&mut self, id: NodeId) {
        let node = self.ast.node(id);
        let node_flags = node.flags;
        let name = node.name.clone().unwrap_or_default();
        self.specifiers(node_flags);
        let children = self.ast.children(id).to_vec();
        let mut rest = children.iter().copied();
        if let Some(ty) = rest.next() {
            self.type_name(ty);
        }
        self.out.push(' ');
        if node_flags & flags::REFERENCE != 0 {
            self.out.push('&');
        }
        self.out.push_str(&name);
        let mut init: Option<NodeId> = None;
        let mut ctor: Option<NodeId> = None;
        for child in rest {
            match self.ast.kind(child) {
                NodeKind::ArraySize => {
                    self.out.push('[');
                    if let Some(dim) = self.ast.child(child, 0) {
                        self.expr(dim);
                    }
                    self.out.push(']');
                }
                NodeKind::CtorInit => ctor = Some(child),
                _ => init = Some(child),
            }
        }
        if let Some(ctor) = ctor {
            self.out.push('(');
            let args = self.ast.children(ctor).to_vec();
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    self.out.push_str(", ");
                }
                self.expr(*arg);
            }
            self.out.push(')');
        } else if let Some(init) = init {
            self.out.push_str(" = ");
            self.expr(init);
        }
        self.out.push(';');
    }

    fn function(&mut self, id: NodeId) {
        let node = self.ast.node(id);
        let is_def = node.kind == NodeKind::FuncDef;
        let name = node.name.clone().unwrap_or_default();
        let node_flags = node.flags;
        self.pad();
        self.specifiers(node_flags);
        let children = self.ast.children(id).to_vec();
        self.type_name(children[0]);
        self.out.push(' ');
        self.out.push_str(&name);
        self.out.push('(');
        let params = self.ast.children(children[1]).to_vec();
        for (i, param) in params.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            let pnode = self.ast.node(*param);
            let pname = pnode.name.clone();
            let pflags = pnode.flags;
            self.specifiers(pflags & flags::CONST);
            if let Some(ty) = self.ast.child(*param, 0) {
                self.type_name(ty);
            }
            if let Some(pname) = pname {
                self.out.push(' ');
                if pflags & flags::REFERENCE != 0 {
                    self.out.push('&');
                }
                self.out.push_str(&pname);
            }
        }
        self.out.push(')');
        if is_def {
            self.out.push('\n');
            self.stmt(children[2]);
        } else {
            self.out.push_str(";\n");
        }
    }

    fn type_name(&mut self, id: NodeId) {
        let name = self.ast.name(id).unwrap_or("int").to_owned();
        self.out.push_str(&name);
    }

    fn expr(&mut self, id: NodeId) {
        let node = self.ast.node(id);
        let name = node.name.clone();
        let value = node.value.clone();
        let children = self.ast.children(id).to_vec();
        match node.kind {
            NodeKind::Identifier => self.out.push_str(name.as_deref().unwrap_or("")),
            NodeKind::IntLiteral => {
                if let Some(Literal::Int { value, unsigned }) = value {
                    if unsigned {
                        let _ = write!(self.out, "{}u", value as u64);
                    } else {
                        let _ = write!(self.out, "{value}");
                    }
                }
            }
            NodeKind::FloatLiteral => match value {
                Some(Literal::Float32(v)) => {
                    let mut buffer = ryu::Buffer::new();
                    let _ = write!(self.out, "{}f", buffer.format(v));
                }
                Some(Literal::Float64(v)) => {
                    let mut buffer = ryu::Buffer::new();
                    self.out.push_str(buffer.format(v));
                }
                _ => {}
            },
            NodeKind::CharLiteral | NodeKind::WideCharLiteral => {
                if node.kind == NodeKind::WideCharLiteral {
                    self.out.push('L');
                }
                if let Some(Literal::Char(code)) = value {
                    let c = char::from_u32(code).unwrap_or('?');
                    let _ = write!(self.out, "{}", escape_char(c));
                }
            }
            NodeKind::StringLiteral => {
                if let Some(Literal::Str(s)) = value {
                    let _ = write!(self.out, "{}", escape_str(&s));
                }
            }
            NodeKind::BoolLiteral => {
                if let Some(Literal::Bool(b)) = value {
                    self.out.push_str(if b { "true" } else { "false" });
                }
            }
            NodeKind::NullptrLiteral => self.out.push_str("nullptr"),
            NodeKind::BinaryExpr => {
                self.out.push('(');
                self.expr(children[0]);
                let _ = write!(self.out, " {} ", name.as_deref().unwrap_or("?"));
                self.expr(children[1]);
                self.out.push(')');
            }
            NodeKind::AssignExpr => {
                self.out.push('(');
                self.expr(children[0]);
                let _ = write!(self.out, " {} ", name.as_deref().unwrap_or("="));
                self.expr(children[1]);
                self.out.push(')');
            }
            NodeKind::UnaryExpr => {
                self.out.push('(');
                self.out.push_str(name.as_deref().unwrap_or("?"));
                self.expr(children[0]);
                self.out.push(')');
            }
            NodeKind::PostfixExpr => {
                self.out.push('(');
                self.expr(children[0]);
                self.out.push_str(name.as_deref().unwrap_or("?"));
                self.out.push(')');
            }
            NodeKind::TernaryExpr => {
                self.out.push('(');
                self.expr(children[0]);
                self.out.push_str(" ? ");
                self.expr(children[1]);
                self.out.push_str(" : ");
                self.expr(children[2]);
                self.out.push(')');
            }
            NodeKind::CallExpr => {
                self.expr(children[0]);
                self.out.push('(');
                for (i, arg) in children[1..].iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expr(*arg);
                }
                self.out.push(')');
            }
            NodeKind::SubscriptExpr => {
                self.expr(children[0]);
                self.out.push('[');
                self.expr(children[1]);
                self.out.push(']');
            }
            NodeKind::MemberExpr => {
                self.expr(children[0]);
                self.out.push('.');
                self.out.push_str(name.as_deref().unwrap_or(""));
            }
            NodeKind::ArrowExpr => {
                self.expr(children[0]);
                self.out.push_str("->");
                self.out.push_str(name.as_deref().unwrap_or(""));
            }
            NodeKind::ScopeExpr => {
                self.expr(children[0]);
                self.out.push_str("::");
                self.out.push_str(name.as_deref().unwrap_or(""));
            }
            NodeKind::CastExpr => {
                self.out.push_str("((");
                self.type_name(children[0]);
                self.out.push(')');
                self.expr(children[1]);
                self.out.push(')');
            }
            NodeKind::FunctionCastExpr => {
                self.type_name(children[0]);
                self.out.push('(');
                self.expr(children[1]);
                self.out.push(')');
            }
            NodeKind::StaticCastExpr => {
                self.out.push_str("static_cast<");
                self.type_name(children[0]);
                self.out.push_str(">(");
                self.expr(children[1]);
                self.out.push(')');
            }
            NodeKind::SizeofExpr => {
                self.out.push_str("sizeof(");
                self.expr(children[0]);
                self.out.push(')');
            }
            NodeKind::SizeofTypeExpr => {
                self.out.push_str("sizeof(");
                self.type_name(children[0]);
                self.out.push(')');
            }
            NodeKind::TypeofExpr => {
                self.out.push_str("typeof(");
                self.expr(children[0]);
                self.out.push(')');
            }
            NodeKind::CommaExpr => {
                self.out.push('(');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expr(*child);
                }
                self.out.push(')');
            }
            NodeKind::InitializerList => {
                self.out.push('{');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expr(*child);
                }
                self.out.push('}');
            }
            NodeKind::DesignatedInit => {
                self.out.push('.');
                self.out.push_str(name.as_deref().unwrap_or(""));
                self.out.push_str(" = ");
                self.expr(children[0]);
            }
            other => {
                let _ = write!(self.out, "/* {other} */");
            }
        }
    }
}

fn escape_char(c: char) -> String {
    match c {
        '\n' => "'\\n'".to_owned(),
        '\t' => "'\\t'".to_owned(),
        '\r' => "'\\r'".to_owned(),
        '\0' => "'\\0'".to_owned(),
        '\\' => "'\\\\'".to_owned(),
        '\'' => "'\\''".to_owned(),
        c => format!("'{c}'"),
    }
}

fn escape_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
