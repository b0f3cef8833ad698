// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Generates the device program of a hash join.
//!
//! The program consists of the kernel library prelude, which declares the
//! entry points `kern_gpuhashjoin_main` and `kern_gpuhashjoin_projection`,
//! followed by the generated functions:
//!
//! - `gpuhashjoin_execute` walks the hash tables of all depths for one outer
//!   row, nested one loop per depth, and emits a result tuple per match;
//! - `gpuhashjoin_projection_mapping` maps a destination column to its
//!   source depth and column;
//! - `gpuhashjoin_projection_datum` stores a source datum into a tuple slot.
//!
//! Alongside the source text, the generator returns a [`JoinKernelPlan`] that
//! carries the same information in structured form. The host kernels bound
//! to the entry points execute the plan.

use super::pseudo_schema::{PseudoEntry, PseudoSchema, ResolvedJoin};
use crate::error::{ErrorKind, Result};
use crate::expr::{BoolOp, Expr, Var, VarNo};
use crate::types::{TypeInfo, BOOL_OID, FLOAT4_OID, FLOAT8_OID};
use std::fmt::Write;
use std::sync::Arc;

/// Name of the main join kernel.
pub const MAIN_KERNEL: &str = "kern_gpuhashjoin_main";

/// Name of the projection kernel.
pub const PROJECTION_KERNEL: &str = "kern_gpuhashjoin_projection";

const KERNEL_PRELUDE: &str = r#"/*
 * opencl_hashjoin.h
 *
 * Entry points of the hash join kernels. The generated part of the program
 * defines gpuhashjoin_execute, gpuhashjoin_projection_mapping and
 * gpuhashjoin_projection_datum.
 */
#define KERN_HASHTABLE(kmhash, depth) \
    ((__global kern_hashtable *)((uintptr_t)(kmhash) + (kmhash)->htable_offset[(depth)]))
#define KERN_HASH_FIRST_ENTRY(khtable, hash) \
    kern_hashtable_first_entry((khtable), (hash))
#define KERN_HASH_NEXT_ENTRY(khtable, kentry) \
    kern_hashtable_next_entry((khtable), (kentry))

__kernel void
kern_gpuhashjoin_main(__global kern_parambuf *kparams,
                      __global kern_multihash *kmhash,
                      __global kern_data_store *kds,
                      __global kern_row_map *krowmap,
                      __global kern_resultbuf *kresults);

__kernel void
kern_gpuhashjoin_projection(__global kern_multihash *kmhash,
                            __global kern_data_store *kds,
                            __global kern_resultbuf *kresults,
                            __global kern_data_store *kds_dest);

"#;

/// Records what device code refers to while it is generated.
#[derive(Clone, Debug, Default)]
pub struct CodegenContext {
    used_vars: Vec<Var>,
    used_params: Vec<Expr>,
    type_defs: Vec<TypeInfo>,
}

impl CodegenContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constant or parameter and returns its `KPARAM` index.
    pub fn param_index(&mut self, expr: &Expr) -> usize {
        match self.used_params.iter().position(|p| p == expr) {
            Some(index) => index,
            None => {
                self.used_params.push(expr.clone());
                self.used_params.len() - 1
            }
        }
    }

    pub fn use_var(&mut self, var: &Var) {
        if !self.used_vars.contains(var) {
            self.used_vars.push(var.clone());
        }
    }

    pub fn use_type(&mut self, ty: &TypeInfo) {
        if !self.type_defs.iter().any(|t| t.type_id == ty.type_id) {
            self.type_defs.push(ty.clone());
        }
    }

    pub fn used_vars(&self) -> &[Var] {
        &self.used_vars
    }

    /// Constants and parameters in `KPARAM` order.
    pub fn used_params(&self) -> &[Expr] {
        &self.used_params
    }

    pub fn type_defs(&self) -> &[TypeInfo] {
        &self.type_defs
    }
}

/// Translates expressions over the pseudo relation into device source text.
pub trait DeviceCodeTranslator: Send + Sync {
    fn translate(&self, expr: &Expr, ctx: &mut CodegenContext) -> Result<String>;
}

/// Emits expressions in the kernel library's function call notation.
///
/// Pseudo columns become `KVAR_<resno>`, constants and parameters become
/// `KPARAM_<n>`, and operators become calls of `pgfn_<type>_<op>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelSourceTranslator;

impl DeviceCodeTranslator for KernelSourceTranslator {
    fn translate(&self, expr: &Expr, ctx: &mut CodegenContext) -> Result<String> {
        let text = match expr {
            Expr::Var(var) if var.varno == VarNo::Pseudo => {
                ctx.use_var(var);
                ctx.use_type(&var.ty);
                format!("KVAR_{}", var.attno)
            }
            Expr::Var(var) => Err(ErrorKind::InternalError(format!(
                "device code refers to column {} outside of the pseudo relation",
                var.attno
            )))?,
            Expr::PlaceHolder { phid, .. } => Err(ErrorKind::InternalError(format!(
                "placeholder {} was not resolved to a pseudo column",
                phid
            )))?,
            Expr::Const(_, ty) | Expr::Param(_, ty) => {
                ctx.use_type(ty);
                format!("KPARAM_{}", ctx.param_index(expr))
            }
            Expr::Op { op, args, .. } => {
                let arg_ty = args.first().map(Expr::ty).ok_or_else(|| {
                    ErrorKind::InternalError(format!("operator {} without arguments", op.symbol()))
                })?;
                ctx.use_type(&arg_ty);
                let args = args
                    .iter()
                    .map(|arg| self.translate(arg, ctx))
                    .collect::<Result<Vec<_>>>()?;
                format!(
                    "pgfn_{}_{}(errcode, {})",
                    arg_ty.name,
                    op.func_suffix(),
                    args.join(", ")
                )
            }
            Expr::Bool { op, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.translate(arg, ctx))
                    .collect::<Result<Vec<_>>>()?;
                match op {
                    BoolOp::And => format!("({})", args.join(" && ")),
                    BoolOp::Or => format!("({})", args.join(" || ")),
                    BoolOp::Not => format!("!({})", args.join(", ")),
                }
            }
            Expr::NullTest { arg, is_null } => {
                let arg = self.translate(arg, ctx)?;
                if *is_null {
                    format!("PG_ISNULL({})", arg)
                } else {
                    format!("!PG_ISNULL({})", arg)
                }
            }
        };

        Ok(text)
    }
}

/// The clauses of one depth in terms of the pseudo relation.
#[derive(Clone, Debug, Default)]
pub struct DepthKernelPlan {
    pub hash_outer: Vec<Expr>,
    pub hash_clauses: Vec<Expr>,
    pub qual: Vec<Expr>,
}

/// The semantics of the generated program.
#[derive(Clone, Debug)]
pub struct JoinKernelPlan {
    /// Column types of the relation at each depth, starting with the outer
    /// relation.
    pub source_types: Vec<Arc<[TypeInfo]>>,
    pub entries: Vec<PseudoEntry>,
    pub nhost: usize,
    /// Per inner relation, starting at depth 1.
    pub depths: Vec<DepthKernelPlan>,
    /// Constants and parameters in `KPARAM` order.
    pub used_params: Vec<Expr>,
}

impl JoinKernelPlan {
    pub fn ndepths(&self) -> usize {
        self.depths.len()
    }

    /// The number of `u32` values per result tuple: the outer row and one
    /// hash entry per depth.
    pub fn nrels(&self) -> usize {
        self.depths.len() + 1
    }

    pub fn host_entries(&self) -> &[PseudoEntry] {
        &self.entries[..self.nhost]
    }
}

/// The output of [`KernelCodeGenerator::generate`].
#[derive(Clone, Debug)]
pub struct GeneratedKernel {
    pub source: String,
    pub plan: Arc<JoinKernelPlan>,
}

struct SourceWriter {
    buf: String,
    indent: usize,
}

impl SourceWriter {
    fn new() -> Self {
        Self {
            buf: String::new(),
            indent: 0,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.buf.push_str("    ");
        }
        self.buf.push_str(text);
        self.buf.push('\n');
    }

    fn open(&mut self) {
        self.line("{");
        self.indent += 1;
    }

    fn close(&mut self) {
        self.indent = self.indent.saturating_sub(1);
        self.line("}");
    }
}

/// The base type of fixed-length types in the type templates.
fn simple_base_type(ty: &TypeInfo) -> &'static str {
    match (ty.type_id, ty.len) {
        (BOOL_OID, _) => "cl_bool",
        (FLOAT4_OID, _) => "cl_float",
        (FLOAT8_OID, _) => "cl_double",
        (_, 1) => "cl_char",
        (_, 2) => "cl_short",
        (_, 4) => "cl_int",
        (_, 8) => "cl_long",
        _ => "Datum",
    }
}

fn is_by_reference(ty: &TypeInfo) -> bool {
    ty.is_varlena() || !ty.byval
}

pub struct KernelCodeGenerator {
    translator: Arc<dyn DeviceCodeTranslator>,
}

impl KernelCodeGenerator {
    pub fn new(translator: Arc<dyn DeviceCodeTranslator>) -> Self {
        Self { translator }
    }

    /// Generates the device program.
    ///
    /// `source_types[d]` holds the column types of the relation at depth `d`.
    pub fn generate(
        &self,
        schema: &PseudoSchema,
        resolved: &ResolvedJoin,
        source_types: Vec<Arc<[TypeInfo]>>,
    ) -> Result<GeneratedKernel> {
        let ndepths = resolved.depths.len();
        if source_types.len() != ndepths + 1 {
            Err(ErrorKind::InternalError(format!(
                "{} source relations for {} depths",
                source_types.len(),
                ndepths
            )))?;
        }

        let mut ctx = CodegenContext::new();
        let execute = self.execute_function(schema, resolved, &mut ctx)?;
        let projection = Self::projection_functions(schema)?;

        let mut source = String::with_capacity(KERNEL_PRELUDE.len() + execute.len() * 2);
        source.push_str(KERNEL_PRELUDE);
        source.push_str(&Self::type_declarations(ctx.type_defs()));
        source.push_str(&execute);
        source.push_str(&projection);

        let plan = JoinKernelPlan {
            source_types,
            entries: schema.entries().to_vec(),
            nhost: schema.nhost(),
            depths: resolved
                .depths
                .iter()
                .map(|d| DepthKernelPlan {
                    hash_outer: d.hash_outer.clone(),
                    hash_clauses: d.hash_clauses.clone(),
                    qual: d.qual.clone(),
                })
                .collect(),
            used_params: ctx.used_params().to_vec(),
        };

        Ok(GeneratedKernel {
            source,
            plan: Arc::new(plan),
        })
    }

    fn type_declarations(types: &[TypeInfo]) -> String {
        let mut decl = String::new();
        for ty in types {
            if is_by_reference(ty) {
                decl.push_str(&format!(
                    "STROMCL_VARLENA_TYPE_TEMPLATE({0})\n\
                     STROMCL_VARLENA_HASHKEY_TEMPLATE({0})\n\
                     STROMCL_VARLENA_HASHREF_TEMPLATE({0})\n",
                    ty.name
                ));
            } else {
                decl.push_str(&format!(
                    "STROMCL_SIMPLE_TYPE_TEMPLATE({0},{1})\n\
                     STROMCL_SIMPLE_HASHKEY_TEMPLATE({0},{1})\n\
                     STROMCL_SIMPLE_HASHREF_TEMPLATE({0},{1})\n",
                    ty.name,
                    simple_base_type(ty)
                ));
            }
        }
        decl.push('\n');
        decl
    }

    fn translate_all(&self, exprs: &[Expr], ctx: &mut CodegenContext) -> Result<Vec<String>> {
        exprs
            .iter()
            .map(|expr| self.translate_checked(expr, ctx))
            .collect()
    }

    fn translate_checked(&self, expr: &Expr, ctx: &mut CodegenContext) -> Result<String> {
        let text = self.translator.translate(expr, ctx)?;
        if text.trim().is_empty() {
            Err(ErrorKind::InternalError(format!(
                "translator produced no code for {:?}",
                expr
            )))?;
        }
        Ok(text)
    }

    fn execute_function(
        &self,
        schema: &PseudoSchema,
        resolved: &ResolvedJoin,
        ctx: &mut CodegenContext,
    ) -> Result<String> {
        let ndepths = resolved.depths.len();
        let device_entries = |depth: usize| {
            schema
                .entries()
                .iter()
                .filter(move |e| e.srcdepth == depth && e.ref_device)
        };

        let mut body = SourceWriter::new();
        body.indent = 1;

        for entry in device_entries(0) {
            ctx.use_type(&entry.ty);
            body.line(&format!(
                "pg_{0}_t KVAR_{1} = pg_{0}_vref(kds,ktoast,errcode,{2},kds_index);",
                entry.ty.name, entry.resno, entry.srcresno
            ));
        }
        body.line("cl_int n_matches = 0;");
        body.line("");

        for (index, depth) in resolved.depths.iter().enumerate() {
            let d = index + 1;
            let keys = self.translate_all(&depth.hash_outer, ctx)?;

            body.open();
            body.line(&format!("cl_uint hash_{};", d));
            body.line("");
            body.line(&format!("INIT_CRC32(hash_{});", d));
            for (key, expr) in keys.iter().zip(&depth.hash_outer) {
                let ty = expr.ty();
                ctx.use_type(&ty);
                body.line(&format!(
                    "hash_{0} = pg_{1}_hashkey(pg_crc32_table, hash_{0}, {2});",
                    d, ty.name, key
                ));
            }
            body.line(&format!("FIN_CRC32(hash_{});", d));
            body.line("");
            body.line(&format!(
                "for (kentry_{0} = KERN_HASH_FIRST_ENTRY(khtable_{0}, hash_{0});",
                d
            ));
            body.line(&format!("     kentry_{} != NULL;", d));
            body.line(&format!(
                "     kentry_{0} = KERN_HASH_NEXT_ENTRY(khtable_{0}, kentry_{0}))",
                d
            ));
            body.open();

            for entry in device_entries(d) {
                ctx.use_type(&entry.ty);
                body.line(&format!(
                    "pg_{0}_t KVAR_{1} = pg_{0}_hashref(khtable_{2},kentry_{2},errcode,{3});",
                    entry.ty.name, entry.resno, d, entry.srcresno
                ));
            }

            let mut cond = format!("kentry_{0}->hash == hash_{0}", d);
            for clause in self
                .translate_all(&depth.hash_clauses, ctx)?
                .into_iter()
                .chain(self.translate_all(&depth.qual, ctx)?)
            {
                write!(cond, " &&\n{}    EVAL({})", "    ".repeat(body.indent), clause)
                    .map_err(|e| ErrorKind::InternalError(e.to_string()))?;
            }
            body.line(&format!("if ({})", cond));
            body.open();
        }

        body.line("n_matches++;");
        body.line("if (rbuffer)");
        body.open();
        body.line("rbuffer[0] = (cl_int)kds_index + 1;");
        for d in 1..=ndepths {
            body.line(&format!(
                "rbuffer[{0}] = (cl_int)((uintptr_t)kentry_{0} - (uintptr_t)khtable_{0});",
                d
            ));
        }
        body.line(&format!("rbuffer += {};", ndepths + 1));
        body.close();

        for _ in 0..ndepths {
            body.close(); // if
            body.close(); // for
            body.close(); // block
        }
        body.line("return n_matches;");
        body.indent = 0;
        body.line("}");
        body.line("");

        let mut decl = SourceWriter::new();
        decl.line("static cl_uint");
        decl.line("gpuhashjoin_execute(__private cl_int *errcode,");
        decl.line("                    __global kern_parambuf *kparams,");
        decl.line("                    __global kern_multihash *kmhash,");
        decl.line("                    __local cl_uint *pg_crc32_table,");
        decl.line("                    __global kern_data_store *kds,");
        decl.line("                    __global kern_data_store *ktoast,");
        decl.line("                    size_t kds_index,");
        decl.line("                    __global cl_int *rbuffer)");
        decl.open();
        for d in 1..=ndepths {
            decl.line(&format!(
                "__global kern_hashtable *khtable_{0} = KERN_HASHTABLE(kmhash,{0});",
                d
            ));
        }
        for d in 1..=ndepths {
            decl.line(&format!("__global kern_hashentry *kentry_{};", d));
        }
        for (index, param) in ctx.used_params().iter().enumerate() {
            decl.line(&format!(
                "pg_{0}_t KPARAM_{1} = pg_{0}_param(kparams,errcode,{1});",
                param.ty().name,
                index
            ));
        }

        decl.buf.push_str(&body.buf);
        Ok(decl.buf)
    }

    fn projection_functions(schema: &PseudoSchema) -> Result<String> {
        let host = schema.host_entries();
        let mut src = SourceWriter::new();

        src.line("static void");
        src.line("gpuhashjoin_projection_mapping(cl_int dest_colidx,");
        src.line("                               __private cl_uint *src_depth,");
        src.line("                               __private cl_uint *src_colidx)");
        src.open();
        src.line("switch (dest_colidx)");
        src.open();
        for entry in host {
            src.line(&format!("case {}:", entry.resno - 1));
            src.indent += 1;
            src.line(&format!("*src_depth = {};", entry.srcdepth));
            src.line(&format!("*src_colidx = {};", entry.srcresno));
            src.line("break;");
            src.indent -= 1;
        }
        src.line("default:");
        src.indent += 1;
        src.line("/* should not run here */");
        src.line("break;");
        src.indent -= 1;
        src.close();
        src.close();
        src.line("");

        src.line("static void");
        src.line("gpuhashjoin_projection_datum(__private cl_int *errcode,");
        src.line("                             __global Datum *slot_values,");
        src.line("                             __global cl_char *slot_isnull,");
        src.line("                             cl_int depth,");
        src.line("                             cl_int colidx,");
        src.line("                             hostptr_t hostaddr,");
        src.line("                             __global void *datum)");
        src.open();
        src.line("switch (depth)");
        src.open();

        let max_depth = host.iter().map(|e| e.srcdepth).max();
        for depth in max_depth.map_or(0..0, |max| 0..max + 1) {
            let mut columns: Vec<&PseudoEntry> =
                host.iter().filter(|e| e.srcdepth == depth).collect();
            if columns.is_empty() {
                continue;
            }
            columns.sort_by_key(|e| e.srcresno);

            src.line(&format!("case {}:", depth));
            src.indent += 1;
            src.line("switch (colidx)");
            src.open();
            for entry in columns {
                let slot = entry.resno - 1;
                src.line(&format!("case {}:", entry.srcresno));
                src.indent += 1;
                src.line("if (!datum)");
                src.indent += 1;
                src.line(&format!("slot_isnull[{}] = (cl_char) 1;", slot));
                src.indent -= 1;
                src.line("else");
                src.open();
                src.line(&format!("slot_isnull[{}] = (cl_char) 0;", slot));
                src.line(&Self::datum_store(entry, slot)?);
                src.close();
                src.line("break;");
                src.indent -= 1;
            }
            src.line("default:");
            src.indent += 1;
            src.line("break;");
            src.indent -= 1;
            src.close();
            src.line("break;");
            src.indent -= 1;
        }

        src.line("default:");
        src.indent += 1;
        src.line("break;");
        src.indent -= 1;
        src.close();
        src.close();

        Ok(src.buf)
    }

    /// The statement that stores one datum into its tuple slot.
    fn datum_store(entry: &PseudoEntry, slot: u16) -> Result<String> {
        let ty = &entry.ty;
        if is_by_reference(ty) {
            return Ok(format!("slot_values[{}] = (Datum) hostaddr;", slot));
        }

        let stmt = match ty.len {
            1 => format!(
                "slot_values[{}] = (Datum)(*((__global cl_char *) datum));",
                slot
            ),
            2 => format!(
                "slot_values[{}] = (Datum)(*((__global cl_short *) datum));",
                slot
            ),
            4 => format!(
                "slot_values[{}] = (Datum)(*((__global cl_int *) datum));",
                slot
            ),
            8 => format!(
                "slot_values[{}] = (Datum)(*((__global cl_long *) datum));",
                slot
            ),
            len if len > 0 && len < 8 => format!(
                "memcpy(&slot_values[{}], datum, {});",
                slot, len
            ),
            len => Err(ErrorKind::InternalError(format!(
                "unexpected type length {} of by-value type {} in column {}",
                len, ty.name, entry.resname
            )))?,
        };

        Ok(stmt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BinaryOp, TargetEntry};
    use crate::join::pseudo_schema::DepthClauses;
    use crate::types::Datum;

    fn col(rel: u32, attno: u16, ty: TypeInfo) -> Expr {
        Expr::var(VarNo::Rel(rel), attno, ty)
    }

    fn two_way(extra_ty: TypeInfo) -> Result<(PseudoSchema, ResolvedJoin, Vec<Arc<[TypeInfo]>>)> {
        let sources = vec![
            vec![
                TargetEntry::new(col(1, 1, TypeInfo::int4()), "o_id"),
                TargetEntry::new(col(1, 2, extra_ty.clone()), "o_val"),
            ],
            vec![
                TargetEntry::new(col(2, 1, TypeInfo::int4()), "i_id"),
                TargetEntry::new(col(2, 2, TypeInfo::text()), "i_val"),
            ],
        ];
        let clauses = vec![DepthClauses {
            hash: vec![Expr::equal(
                col(1, 1, TypeInfo::int4()),
                col(2, 1, TypeInfo::int4()),
            )],
            qual: vec![Expr::binary(
                BinaryOp::Gt,
                col(2, 1, TypeInfo::int4()),
                Expr::Const(Datum::Int4(0), TypeInfo::int4()),
            )],
            host: vec![],
        }];
        let tlist = vec![
            TargetEntry::new(col(1, 2, extra_ty.clone()), "o_val"),
            TargetEntry::new(col(2, 2, TypeInfo::text()), "i_val"),
        ];
        let types = vec![
            Arc::from(vec![TypeInfo::int4(), extra_ty]),
            Arc::from(vec![TypeInfo::int4(), TypeInfo::text()]),
        ];
        let (schema, resolved) = PseudoSchema::resolve(&sources, &tlist, &clauses)?;
        Ok((schema, resolved, types))
    }

    #[test]
    fn generates_nested_lookup() {
        let (schema, resolved, types) = two_way(TypeInfo::int8()).unwrap();
        let generated = KernelCodeGenerator::new(Arc::new(KernelSourceTranslator))
            .generate(&schema, &resolved, types)
            .unwrap();
        let src = &generated.source;

        assert!(src.contains("__kernel void\nkern_gpuhashjoin_main("));
        assert!(src.contains("INIT_CRC32(hash_1);"));
        assert!(src.contains("hash_1 = pg_int4_hashkey(pg_crc32_table, hash_1, KVAR_3);"));
        assert!(src.contains("KERN_HASH_FIRST_ENTRY(khtable_1, hash_1)"));
        assert!(src.contains("pg_int4_t KVAR_4 = pg_int4_hashref(khtable_1,kentry_1,errcode,0);"));
        assert!(src.contains("EVAL(pgfn_int4_gt(errcode, KVAR_4, KPARAM_0))"));
        assert!(src.contains("STROMCL_SIMPLE_HASHKEY_TEMPLATE(int4,cl_int)"));
        assert!(!src.contains("pg_text_"));
        assert!(src.contains("slot_values[0] = (Datum)(*((__global cl_long *) datum));"));
        assert!(src.contains("slot_values[1] = (Datum) hostaddr;"));
        assert_eq!(generated.plan.used_params.len(), 1);
        assert_eq!(generated.plan.nrels(), 2);
    }

    #[test]
    fn odd_by_value_width_is_copied_bytewise() {
        let (schema, resolved, types) =
            two_way(TypeInfo::custom(9001, "triple", 3, true)).unwrap();
        let generated = KernelCodeGenerator::new(Arc::new(KernelSourceTranslator))
            .generate(&schema, &resolved, types)
            .unwrap();
        assert!(generated.source.contains("memcpy(&slot_values[0], datum, 3);"));
    }

    #[test]
    fn wide_by_value_type_is_rejected() {
        let (schema, resolved, types) =
            two_way(TypeInfo::custom(9002, "wide", 16, true)).unwrap();
        let result = KernelCodeGenerator::new(Arc::new(KernelSourceTranslator))
            .generate(&schema, &resolved, types);
        match result {
            Err(e) => match e.kind() {
                ErrorKind::InternalError(msg) => assert!(msg.contains("unexpected type length")),
                other => panic!("unexpected error kind {:?}", other),
            },
            Ok(_) => panic!("generated code for a 16 byte by-value type"),
        }
    }

    #[test]
    fn translator_rejects_base_relation_columns() {
        let mut ctx = CodegenContext::new();
        let expr = col(1, 1, TypeInfo::int4());
        assert!(KernelSourceTranslator.translate(&expr, &mut ctx).is_err());
    }

    #[test]
    fn params_are_deduplicated() {
        let mut ctx = CodegenContext::new();
        let param = Expr::Param(4, TypeInfo::int8());
        let expr = Expr::and(vec![
            Expr::equal(Expr::var(VarNo::Pseudo, 1, TypeInfo::int8()), param.clone()),
            Expr::NullTest {
                arg: Box::new(param),
                is_null: false,
            },
        ]);
        let text = KernelSourceTranslator.translate(&expr, &mut ctx).unwrap();
        assert_eq!(
            text,
            "(pgfn_int8_eq(errcode, KVAR_1, KPARAM_0) && !PG_ISNULL(KPARAM_0))"
        );
        assert_eq!(ctx.used_params().len(), 1);
        assert_eq!(ctx.used_vars().len(), 1);
    }
}
