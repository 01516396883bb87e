//! Structured-statement interpretation: statement kind to abstract keyword,
//! plus the tables and procedures the statement references.

use sqlparser::ast::{
    FromTable, ObjectName, ObjectType, Query, SetExpr, Statement, TableFactor, TableWithJoins,
};

use crate::{Procedure, QueryInfo, Table};

/// Recursion ceiling for nested joins / derived tables. A subtree past this
/// depth contributes nothing rather than a misleading partial table list.
const MAX_JOIN_DEPTH: u32 = 100;

/// Interpret a parsed statement into `info`. Returns false when the statement
/// kind is not handled, in which case the caller degrades to the fallback.
pub(crate) fn interpret(stmt: &Statement, info: &mut QueryInfo) -> bool {
    match stmt {
        Statement::Query(query) => {
            info.abstract_.push_str("SELECT");
            let tables = tables_from_query(query, 0);
            append_tables(info, tables);
        }
        Statement::Insert(insert) => {
            // REPLACE parses as an INSERT with the replace flag set.
            info.abstract_
                .push_str(if insert.replace_into { "REPLACE" } else { "INSERT" });
            if let Some(table) = table_from_object_name(&insert.table_name) {
                append_tables(info, vec![table]);
            }
        }
        Statement::Update { table, from, .. } => {
            info.abstract_.push_str("UPDATE");
            let mut tables = tables_from_table_with_joins(table, 0);
            if let Some(from) = from {
                tables.extend(tables_from_table_with_joins(from, 0));
            }
            append_tables(info, tables);
        }
        Statement::Delete(delete) => {
            info.abstract_.push_str("DELETE");
            let list = match &delete.from {
                FromTable::WithFromKeyword(list) => list,
                FromTable::WithoutKeyword(list) => list,
            };
            let mut tables = Vec::new();
            for twj in list {
                tables.extend(tables_from_table_with_joins(twj, 0));
            }
            append_tables(info, tables);
        }
        Statement::Use { .. } => {
            info.abstract_.push_str("USE");
        }
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowCollation { .. }
        | Statement::ShowFunctions { .. } => {
            info.abstract_.push_str(&stmt.to_string().to_uppercase());
        }
        Statement::Call(func) => {
            info.abstract_.push_str("CALL");
            let (db, name) = split_object_name(&func.name);
            info.procedures.push(Procedure { db, name });
        }
        Statement::CreateTable { name, .. } => {
            ddl_abstract(info, "CREATE", name);
        }
        Statement::AlterTable { name, .. } => {
            ddl_abstract(info, "ALTER", name);
        }
        Statement::Drop {
            object_type: ObjectType::Table,
            names,
            ..
        } => {
            if let Some(name) = names.first() {
                ddl_abstract(info, "DROP", name);
            } else {
                info.abstract_.push_str("DROP TABLE");
            }
        }
        _ => return false,
    }
    true
}

fn ddl_abstract(info: &mut QueryInfo, action: &str, name: &ObjectName) {
    let (db, table) = split_object_name(name);
    let display = Table {
        db: db.clone(),
        table: table.clone(),
    };
    info.abstract_ = format!("{action} TABLE {display}");
    info.tables.push(display);
}

fn append_tables(info: &mut QueryInfo, tables: Vec<Table>) {
    if tables.is_empty() {
        return;
    }
    // The abstract keeps the raw (possibly repeated) list; dedup applies only
    // to the stored tables.
    let joined = tables
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    info.abstract_.push(' ');
    info.abstract_.push_str(&joined);
    info.tables.extend(tables);
}

fn tables_from_query(query: &Query, depth: u32) -> Vec<Table> {
    if depth > MAX_JOIN_DEPTH {
        return Vec::new();
    }
    tables_from_set_expr(&query.body, depth + 1)
}

fn tables_from_set_expr(expr: &SetExpr, depth: u32) -> Vec<Table> {
    if depth > MAX_JOIN_DEPTH {
        return Vec::new();
    }
    let mut tables = Vec::new();
    match expr {
        SetExpr::Select(select) => {
            for twj in &select.from {
                tables.extend(tables_from_table_with_joins(twj, depth));
            }
        }
        SetExpr::Query(query) => {
            tables.extend(tables_from_query(query, depth));
        }
        SetExpr::SetOperation { left, right, .. } => {
            // UNION and friends: left side first, then right.
            tables.extend(tables_from_set_expr(left, depth + 1));
            tables.extend(tables_from_set_expr(right, depth + 1));
        }
        _ => {}
    }
    tables
}

fn tables_from_table_with_joins(twj: &TableWithJoins, depth: u32) -> Vec<Table> {
    let mut tables = tables_from_factor(&twj.relation, depth);
    for join in &twj.joins {
        tables.extend(tables_from_factor(&join.relation, depth));
    }
    tables
}

fn tables_from_factor(factor: &TableFactor, depth: u32) -> Vec<Table> {
    if depth > MAX_JOIN_DEPTH {
        return Vec::new();
    }
    match factor {
        TableFactor::Table { name, .. } => table_from_object_name(name)
            .filter(|t| !t.table.eq_ignore_ascii_case("dual"))
            .into_iter()
            .collect(),
        TableFactor::Derived { subquery, .. } => tables_from_query(subquery, depth + 1),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => tables_from_table_with_joins(table_with_joins, depth + 1),
        _ => Vec::new(),
    }
}

fn table_from_object_name(name: &ObjectName) -> Option<Table> {
    let (db, table) = split_object_name(name);
    if db.is_empty() && table.is_empty() {
        return None;
    }
    Some(Table { db, table })
}

fn split_object_name(name: &ObjectName) -> (String, String) {
    let parts = &name.0;
    match parts.len() {
        0 => (String::new(), String::new()),
        1 => (String::new(), parts[0].value.clone()),
        _ => (
            parts[0].value.clone(),
            parts[parts.len() - 1].value.clone(),
        ),
    }
}
