diesel::table! {
    products (sku) {
        sku -> Varchar,
        upc -> Varchar,
        name -> Varchar,
    }
}

diesel::table! {
    product_inventory (sku) {
        sku -> Varchar,
        available -> Int8,
    }
}

diesel::table! {
    production_events (id) {
        id -> Int8,
        request_id -> Varchar,
        sku -> Varchar,
        quantity -> Int8,
        created -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Int8,
        request_id -> Varchar,
        requester -> Varchar,
        sku -> Varchar,
        state -> Varchar,
        reserved_quantity -> Int8,
        requested_quantity -> Int8,
        created -> Timestamptz,
    }
}

diesel::joinable!(product_inventory -> products (sku));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    product_inventory,
    production_events,
    reservations,
);
